//! The emission driver behind [`Assembler::finish`].
//!
//! Descriptors are handed to the [`MetadataEmitter`] in dependency order: types first, then
//! their fields and methods, then everything that needs member tokens (local references,
//! events, properties, overrides, attributes), and bodies last, once every token they embed
//! is final. Each phase only looks at items still flagged new, so a second `finish` in
//! edit-and-continue mode emits nothing but the delta.

use crate::{
    assembler::{
        class::{ClassId, ClassSlot, MODULE_CLASS},
        members::{CustomAttribute, GenericOwner, PInvokeDecl, QueuedAttribute, SecurityDecl},
        method::IlFixupKind,
        Assembler, EmittedClass, EmittedImage, EmittedMethod,
    },
    emitter::{
        EventDefinition, FieldDefinition, GenericParamDefinition, MetadataEmitter, MethodDefinition,
        ParamDefinition, PropertyDefinition, Section, SectionAllocator, TypeDefinition,
    },
    manifest::resources::build_resource_blob,
    metadata::token::{Token, TokenRef},
    utils::{align_up, push_le, to_u32, write_le},
    Error, Result,
};

impl<E: MetadataEmitter, S: SectionAllocator> Assembler<E, S> {
    /// Emits everything declared since the last pass and places the new method bodies.
    ///
    /// # Errors
    /// Returns the first failure of a phase, or [`Error::CompilationFailed`] if any error
    /// was recorded during the unit.
    pub fn finish(&mut self) -> Result<EmittedImage> {
        self.check_unterminated()?;

        let new_classes = self.emit_classes()?;
        let field_rvas = self.emit_fields_methods()?;
        self.resolve_local_member_refs()?;
        self.emit_events_properties()?;
        self.emit_method_impls()?;
        self.close_phase("member emission")?;

        if let Some(name) = self.module_name.clone().filter(|_| !self.module_name_emitted) {
            let result = self.emitter.set_module_name(&name);
            self.recover(result)?;
            self.module_name_emitted = true;
        }
        self.emit_manifest()?;
        let attributes = std::mem::take(&mut self.module_attributes);
        self.emit_custom_attributes(Token::MODULE, attributes)?;
        self.resolve_local_member_refs()?;
        self.flush_attribute_queue()?;
        self.close_phase("manifest emission")?;

        self.do_global_fixups()?;
        self.do_local_member_ref_fixups()?;
        self.close_phase("fixups")?;

        let mut image = EmittedImage {
            il_only: self.il_only,
            ..EmittedImage::default()
        };
        self.emit_bodies(&mut image)?;
        self.emit_field_rvas(field_rvas)?;
        self.close_phase("method bodies")?;

        let pending = self.manifest.take_pending_resources();
        if !pending.is_empty() {
            let result = build_resource_blob(&pending);
            if let Some((blob, resources)) = self.recover(result)? {
                image.resource_blob = blob;
                image.resources = resources;
            }
        }

        image.classes = new_classes
            .into_iter()
            .filter_map(|id| self.classes.get(id))
            .map(|class| EmittedClass {
                token: class.token,
                name: class.full_name.clone(),
                fields: class.fields.iter().map(|f| f.token).filter(|t| !t.is_null()).collect(),
                methods: class
                    .methods
                    .iter()
                    .filter_map(|&id| self.methods.get(id))
                    .map(|m| m.token)
                    .filter(|t| !t.is_null())
                    .collect(),
                events: class.events.iter().map(|e| e.token).filter(|t| !t.is_null()).collect(),
                properties: class.properties.iter().map(|p| p.token).filter(|t| !t.is_null()).collect(),
            })
            .collect();
        image.entry_point = self
            .entry_point
            .and_then(|id| self.methods.get(id))
            .map(|method| method.token)
            .filter(|token| !token.is_null());
        image.il_only = self.il_only;

        if self.diagnostics.has_errors() {
            let errors = self.diagnostics.error_count();
            log::error!("compilation failed: {}", self.diagnostics.summary());
            return Err(Error::CompilationFailed(errors));
        }

        log::info!(
            "emitted {} class(es), {} method body(ies), {} resource(s)",
            image.classes.len(),
            image.methods.len(),
            image.resources.len()
        );
        Ok(image)
    }

    fn check_unterminated(&mut self) -> Result<()> {
        if let Some(builder) = self.current.take() {
            let name = self.methods.get(builder.id).map_or("", |m| m.name.as_str()).to_string();
            self.report(Error::InvalidScope(format!("Method '{name}' is not closed")))?;
        }
        if let Some(&id) = self.class_stack.last() {
            let name = self.classes.name(id).to_string();
            self.report(Error::InvalidScope(format!("Class '{name}' is not closed")))?;
            self.class_stack.clear();
        }
        Ok(())
    }

    /// Defines every new class, in table order so that enclosers come first.
    ///
    /// Classes that were only referenced are reported once all others are defined.
    fn emit_classes(&mut self) -> Result<Vec<ClassId>> {
        let mut emitted = Vec::new();
        let mut gaps = 0;

        for id in 0..self.classes.len() {
            if id == MODULE_CLASS && self.options.enc_mode {
                if let Some(module) = self.classes.get_mut(id) {
                    module.is_new = false;
                }
                continue;
            }
            let class = match self.classes.slot(id) {
                Some(ClassSlot::Defined(class)) if class.is_new => class,
                Some(ClassSlot::Unresolved { .. }) => {
                    gaps += 1;
                    continue;
                }
                _ => continue,
            };

            let encloser = class
                .encloser
                .and_then(|encloser| self.classes.slot(encloser))
                .map(ClassSlot::token);
            let definition = TypeDefinition {
                name: class.name.clone(),
                namespace: class.namespace.clone(),
                flags: class.flags,
                extends: class.extends.unwrap_or(Token::NIL),
                interfaces: class.implements.clone(),
                encloser,
            };
            let expected = class.token;

            let result = self.emitter.define_type(&definition);
            let Some(token) = self.recover(result)? else {
                continue;
            };
            log::trace!("class '{}' -> {}", self.classes.name(id), token);
            // Rows after a placeholder shift; the unit fails on the placeholder anyway
            if gaps == 0 && token != expected {
                self.report(Error::TokenMismatch {
                    expected,
                    actual: token,
                })?;
            }

            let class = self.class_mut(id)?;
            class.token = token;
            class.is_new = false;
            let attributes = std::mem::take(&mut class.custom_attributes);
            let security = std::mem::take(&mut class.security);

            self.emit_generic_params(token, GenericOwner::Class(id))?;
            self.emit_security(token, &security)?;
            self.emit_custom_attributes(token, attributes)?;
            emitted.push(id);
        }

        for (_, name) in self.classes.unresolved() {
            self.defer(Error::UndefinedClass(name));
        }
        self.close_phase("class emission")?;
        Ok(emitted)
    }

    fn emit_generic_params(&mut self, owner_token: Token, owner: GenericOwner) -> Result<()> {
        let Some(mut params) = self.generic_params_of(owner).map(std::mem::take) else {
            return Ok(());
        };

        for (number, param) in params.iter_mut().enumerate() {
            if !param.token.is_null() {
                continue;
            }
            let definition = GenericParamDefinition {
                number: number as u16,
                flags: param.flags,
                name: param.name.clone(),
            };
            let result = self.emitter.define_generic_param(owner_token, &definition);
            let Some(token) = self.recover(result)? else {
                continue;
            };
            param.token = token;

            let mut constraints = Vec::with_capacity(param.constraints.len());
            for &constraint in &param.constraints {
                let result = self.emitter.define_generic_param_constraint(token, constraint);
                constraints.push(self.recover(result)?);
            }

            let attributes = std::mem::take(&mut param.custom_attributes);
            self.emit_custom_attributes(token, attributes)?;
            for (index, attribute) in std::mem::take(&mut param.constraint_attributes) {
                match constraints.get(index).copied().flatten() {
                    Some(constraint) => self.emit_custom_attributes(constraint, vec![attribute])?,
                    None => self.defer(Error::UndefinedReference(format!(
                        "Custom attribute on undefined constraint #{} of type parameter '{}'",
                        index, param.name
                    ))),
                }
            }
        }

        if let Some(slot) = self.generic_params_of(owner) {
            *slot = params;
        }
        Ok(())
    }

    /// Defines the custom attributes of `owner`.
    ///
    /// Attributes whose constructor is still a pending local reference are queued until
    /// the second resolution pass.
    pub(crate) fn emit_custom_attributes(
        &mut self,
        owner: Token,
        attributes: Vec<CustomAttribute>,
    ) -> Result<()> {
        for attribute in attributes {
            let Some(ctor) = self.resolve(attribute.ctor) else {
                self.attribute_queue.push(QueuedAttribute {
                    owner: TokenRef::Final(owner),
                    attribute,
                    line: self.source.line,
                });
                continue;
            };
            let result = self.emitter.define_custom_attribute(owner, ctor, &attribute.blob);
            self.recover(result)?;
        }
        Ok(())
    }

    /// Defines the permission sets of `owner`.
    pub(crate) fn emit_security(&mut self, owner: Token, security: &[SecurityDecl]) -> Result<()> {
        for decl in security {
            let result = self
                .emitter
                .define_permission_set(owner, decl.action, &decl.encode());
            self.recover(result)?;
        }
        Ok(())
    }

    fn flush_attribute_queue(&mut self) -> Result<()> {
        for queued in std::mem::take(&mut self.attribute_queue) {
            let owner = self.resolve(queued.owner);
            let ctor = self.resolve(queued.attribute.ctor);
            match (owner, ctor) {
                (Some(owner), Some(ctor)) if !owner.is_null() => {
                    let result = self
                        .emitter
                        .define_custom_attribute(owner, ctor, &queued.attribute.blob);
                    self.recover(result)?;
                }
                _ => self.defer(Error::UndefinedReference(format!(
                    "Custom attribute declared at line {} has an unresolved owner or constructor",
                    queued.line
                ))),
            }
        }
        Ok(())
    }

    fn emit_pinvoke(&mut self, member: Token, name: &str, pinvoke: &PInvokeDecl) -> Result<()> {
        let result = self.pinvoke_module_ref(&pinvoke.dll);
        let Some(module) = self.recover(result)? else {
            return Ok(());
        };
        let import = pinvoke.alias.as_deref().unwrap_or(name);
        let result = self
            .emitter
            .define_pinvoke_map(member, pinvoke.flags, import, module);
        self.recover(result)?;
        Ok(())
    }

    /// Emits new fields, class layouts and new methods of every class.
    ///
    /// Returns the fields that still wait for the RVA of their data label.
    fn emit_fields_methods(&mut self) -> Result<Vec<(Token, String)>> {
        let mut field_rvas = Vec::new();
        for id in 0..self.classes.len() {
            let Some(class) = self.classes.get(id) else {
                continue;
            };
            // <Module> is never defined in ENC mode but owns the global members
            if class.is_new && !(id == MODULE_CLASS && self.options.enc_mode) {
                continue;
            }
            let layout_pending = class.fields.iter().any(|field| field.is_new);

            self.emit_fields(id, &mut field_rvas)?;
            if layout_pending {
                self.emit_class_layout(id)?;
            }
            self.emit_methods(id)?;
        }
        Ok(field_rvas)
    }

    fn emit_fields(&mut self, id: ClassId, field_rvas: &mut Vec<(Token, String)>) -> Result<()> {
        let Some(class) = self.classes.get(id) else {
            return Ok(());
        };
        let owner = class.token;

        for index in 0..class.fields.len() {
            let field = match self.classes.get(id).and_then(|class| class.fields.get(index)) {
                Some(field) if field.is_new => field.clone(),
                _ => continue,
            };
            let definition = FieldDefinition {
                class: owner,
                name: field.name.clone(),
                flags: field.flags,
                signature: field.signature.clone(),
                constant: field.constant.clone(),
            };
            let result = self.emitter.define_field(&definition);
            let Some(token) = self.recover(result)? else {
                continue;
            };

            if let Some(native_type) = &field.marshal {
                let result = self.emitter.set_marshal(token, native_type);
                self.recover(result)?;
            }
            if let Some(pinvoke) = &field.pinvoke {
                self.emit_pinvoke(token, &field.name, pinvoke)?;
            }
            if let Some(label) = field.rva_label {
                field_rvas.push((token, label));
            }

            let slot = &mut self.class_mut(id)?.fields[index];
            slot.token = token;
            slot.is_new = false;
            let attributes = std::mem::take(&mut slot.custom_attributes);
            self.emit_custom_attributes(token, attributes)?;
        }
        Ok(())
    }

    /// Sets packing, size and explicit field offsets.
    ///
    /// Explicit offsets in an auto-layout class are dropped with a warning.
    fn emit_class_layout(&mut self, id: ClassId) -> Result<()> {
        let Some(class) = self.classes.get(id) else {
            return Ok(());
        };
        let (token, packing, size, auto) = (class.token, class.packing, class.size, class.is_auto_layout());
        let mut offsets: Vec<(Token, u32)> = class
            .fields
            .iter()
            .filter(|field| !field.token.is_null())
            .filter_map(|field| field.offset.map(|offset| (field.token, offset)))
            .collect();

        if auto && !offsets.is_empty() {
            let name = class.full_name.clone();
            self.policy(format!(
                "Explicit field offsets in auto-layout class '{name}' are ignored"
            ))?;
            offsets.clear();
        }
        if packing.is_none() && size.is_none() && offsets.is_empty() {
            return Ok(());
        }

        let packing = packing.map_or(0, |packing| packing as u16);
        let result = self
            .emitter
            .set_class_layout(token, packing, size.unwrap_or(0), &offsets);
        self.recover(result)?;
        Ok(())
    }

    fn emit_methods(&mut self, class: ClassId) -> Result<()> {
        let Some(owner) = self.classes.get(class) else {
            return Ok(());
        };
        let owner_token = owner.token;
        let ids = owner.methods.clone();

        for id in ids {
            let Some(method) = self.methods.get(id).filter(|method| method.is_new) else {
                continue;
            };
            let definition = MethodDefinition {
                class: owner_token,
                name: method.name.clone(),
                flags: method.flags,
                impl_flags: method.impl_flags,
                signature: method.signature.clone(),
            };
            let pinvoke = method.pinvoke.clone();

            let result = self.emitter.define_method(&definition);
            let Some(token) = self.recover(result)? else {
                continue;
            };
            log::trace!("method '{}' -> {}", definition.name, token);

            self.emit_params(id, token)?;
            if let Some(pinvoke) = &pinvoke {
                self.emit_pinvoke(token, &definition.name, pinvoke)?;
            }
            self.emit_generic_params(token, GenericOwner::Method(id))?;

            let method = self.methods.get_mut(id).ok_or(Error::OutOfBounds)?;
            method.token = token;
            method.is_new = false;
            let security = std::mem::take(&mut method.security);
            let attributes = std::mem::take(&mut method.custom_attributes);
            self.emit_security(token, &security)?;
            self.emit_custom_attributes(token, attributes)?;
        }
        Ok(())
    }

    /// Defines the `Param` rows of a method; sequence 0 is the return value.
    fn emit_params(&mut self, id: usize, method_token: Token) -> Result<()> {
        let count = self.methods.get(id).map_or(0, |method| method.params.len());

        for sequence in 0..=count {
            let Some(method) = self.methods.get(id) else {
                break;
            };
            let param = if sequence == 0 {
                &method.return_param
            } else {
                &method.params[sequence - 1]
            };
            if !param.needs_row() {
                continue;
            }
            let definition = ParamDefinition {
                sequence: sequence as u16,
                name: param.name.clone(),
                flags: param.flags,
                constant: param.constant.clone(),
            };
            let marshal = param.marshal.clone();

            let result = self.emitter.define_param(method_token, &definition);
            let Some(token) = self.recover(result)? else {
                continue;
            };
            if let Some(native_type) = &marshal {
                let result = self.emitter.set_marshal(token, native_type);
                self.recover(result)?;
            }

            let method = self.methods.get_mut(id).ok_or(Error::OutOfBounds)?;
            let param = if sequence == 0 {
                &mut method.return_param
            } else {
                &mut method.params[sequence - 1]
            };
            param.token = token;
            let attributes = std::mem::take(&mut param.custom_attributes);
            self.emit_custom_attributes(token, attributes)?;
        }
        Ok(())
    }

    /// Final token of an accessor, [`Token::NIL`] when absent. `None` if it does not
    /// resolve to a method.
    fn accessor(&self, reference: Option<TokenRef>) -> Option<Token> {
        match reference {
            None => Some(Token::NIL),
            Some(reference) => self.resolve(reference).filter(|token| token.is_method_like()),
        }
    }

    fn accessors(&self, references: &[TokenRef]) -> Option<Vec<Token>> {
        references
            .iter()
            .map(|&reference| self.accessor(Some(reference)))
            .collect()
    }

    fn emit_events_properties(&mut self) -> Result<()> {
        for id in 0..self.classes.len() {
            let Some(class) = self.classes.get(id) else {
                continue;
            };
            let owner = class.token;
            let class_name = class.full_name.clone();

            for index in 0..class.events.len() {
                let event = match self.classes.get(id).and_then(|class| class.events.get(index)) {
                    Some(event) if event.is_new => event.clone(),
                    _ => continue,
                };
                self.class_mut(id)?.events[index].is_new = false;

                let accessors = (
                    self.accessor(event.add_on),
                    self.accessor(event.remove_on),
                    self.accessor(event.fire),
                    self.accessors(&event.others),
                );
                let (Some(add_on), Some(remove_on), Some(fire), Some(others)) = accessors else {
                    self.defer(Error::UndefinedReference(format!(
                        "Invalid accessor of event '{}' in class '{}'",
                        event.name, class_name
                    )));
                    continue;
                };

                let definition = EventDefinition {
                    class: owner,
                    name: event.name.clone(),
                    flags: event.flags,
                    event_type: event.event_type,
                    add_on,
                    remove_on,
                    fire,
                    others,
                };
                let result = self.emitter.define_event(&definition);
                let Some(token) = self.recover(result)? else {
                    continue;
                };
                let slot = &mut self.class_mut(id)?.events[index];
                slot.token = token;
                let attributes = std::mem::take(&mut slot.custom_attributes);
                self.emit_custom_attributes(token, attributes)?;
            }

            let count = self.classes.get(id).map_or(0, |class| class.properties.len());
            for index in 0..count {
                let property = match self.classes.get(id).and_then(|class| class.properties.get(index)) {
                    Some(property) if property.is_new => property.clone(),
                    _ => continue,
                };
                self.class_mut(id)?.properties[index].is_new = false;

                let accessors = (
                    self.accessor(property.getter),
                    self.accessor(property.setter),
                    self.accessors(&property.others),
                );
                let (Some(getter), Some(setter), Some(others)) = accessors else {
                    self.defer(Error::UndefinedReference(format!(
                        "Invalid accessor of property '{}' in class '{}'",
                        property.name, class_name
                    )));
                    continue;
                };

                let definition = PropertyDefinition {
                    class: owner,
                    name: property.name.clone(),
                    flags: property.flags,
                    signature: property.signature.clone(),
                    constant: property.constant.clone(),
                    getter,
                    setter,
                    others,
                };
                let result = self.emitter.define_property(&definition);
                let Some(token) = self.recover(result)? else {
                    continue;
                };
                let slot = &mut self.class_mut(id)?.properties[index];
                slot.token = token;
                let attributes = std::mem::take(&mut slot.custom_attributes);
                self.emit_custom_attributes(token, attributes)?;
            }
        }
        Ok(())
    }

    fn emit_method_impls(&mut self) -> Result<()> {
        for id in 0..self.classes.len() {
            let Some(class) = self.classes.get(id) else {
                continue;
            };
            let owner = class.token;
            let pending: Vec<(usize, TokenRef, TokenRef)> = class
                .method_impls
                .iter()
                .enumerate()
                .filter(|(_, method_impl)| method_impl.is_new)
                .map(|(index, method_impl)| (index, method_impl.body, method_impl.declaration))
                .collect();

            for (index, body, declaration) in pending {
                self.class_mut(id)?.method_impls[index].is_new = false;
                match (self.resolve(body), self.resolve(declaration)) {
                    (Some(body), Some(declaration)) if body.is_method_like() && declaration.is_method_like() => {
                        let result = self.emitter.define_method_impl(owner, body, declaration);
                        self.recover(result)?;
                    }
                    _ => {
                        let name = self.classes.name(id).to_string();
                        self.defer(Error::UndefinedReference(format!(
                            "Unresolved .override in class '{name}'"
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    /// Places every new body and sets its RVA.
    ///
    /// Identical bodies share one RVA when folding is on. Bodies with sequence points or
    /// data label operands are never folded.
    fn emit_bodies(&mut self, image: &mut EmittedImage) -> Result<()> {
        let mut delta = Vec::new();

        for id in 0..self.methods.len() {
            let method = &self.methods[id];
            if !method.has_new_body || method.token.is_null() {
                continue;
            }
            let Some(body) = method.body.clone() else {
                continue;
            };
            let (token, name, sequence_points) = (method.token, method.name.clone(), method.sequence_points.clone());
            let owner = self.classes.slot(method.class).map_or(Token::NIL, ClassSlot::token);
            let foldable = self.options.fold_code
                && sequence_points.is_empty()
                && !body
                    .il_fixups
                    .iter()
                    .any(|fixup| matches!(fixup.kind, IlFixupKind::DataRva(_)));

            let mut bytes = body.bytes;
            let mut folded = false;
            let rva = if self.options.enc_mode {
                let padding = align_up(delta.len(), body.alignment) - delta.len();
                delta.resize(delta.len() + padding, 0);
                let offset = to_u32(delta.len() + 4)?;
                self.patch_data_rvas(&mut bytes, body.header_size, &body.il_fixups)?;
                delta.extend_from_slice(&bytes);
                offset
            } else if let Some(rva) = foldable.then(|| self.folder.find(&bytes)).flatten() {
                log::debug!("body of '{name}' folded into 0x{rva:08X}");
                folded = true;
                rva
            } else {
                let (offset, block) = self
                    .sections
                    .allocate_block(Section::Il, bytes.len(), body.alignment)?;
                block.copy_from_slice(&bytes);
                self.relocate_body(offset, body.header_size, &body.il_fixups)?;
                let rva = self.sections.method_rva(offset);
                if foldable {
                    self.folder.insert(bytes.clone(), rva);
                }
                rva
            };

            let result = self.emitter.set_method_rva(token, rva);
            self.recover(result)?;

            let method = &mut self.methods[id];
            method.rva = Some(rva);
            method.folded = folded;
            method.has_new_body = false;
            image.methods.push(EmittedMethod {
                token,
                name,
                owner,
                rva,
                body: bytes,
                folded,
                sequence_points,
            });
        }

        if self.options.enc_mode && !delta.is_empty() {
            let mut buffer = Vec::with_capacity(delta.len() + 4);
            push_le(&mut buffer, to_u32(delta.len())?);
            buffer.extend_from_slice(&delta);
            image.delta_il = buffer;
        }
        Ok(())
    }

    /// Writes data label RVAs straight into a body that is not placed in the IL section.
    fn patch_data_rvas(
        &mut self,
        bytes: &mut [u8],
        header_size: usize,
        fixups: &[crate::assembler::method::IlFixup],
    ) -> Result<()> {
        for fixup in fixups {
            let IlFixupKind::DataRva(label) = &fixup.kind else {
                continue;
            };
            let Some(rva) = self.data_label_rva(label) else {
                self.defer(Error::UndefinedLabel(label.clone()));
                continue;
            };
            let start = header_size + fixup.offset as usize;
            let slot = bytes.get_mut(start..start + 4).ok_or(Error::OutOfBounds)?;
            write_le(slot, rva)?;
        }
        Ok(())
    }

    fn emit_field_rvas(&mut self, field_rvas: Vec<(Token, String)>) -> Result<()> {
        for (token, label) in field_rvas {
            match self.data_label_rva(&label) {
                Some(rva) => {
                    let result = self.emitter.set_field_rva(token, rva);
                    self.recover(result)?;
                }
                None => {
                    log::debug!("field {token} mapped to undefined data label");
                    self.defer(Error::UndefinedLabel(label));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembler::{
            members::{EventMethod, FieldDecl},
            opcode, ClassHeader, MethodHeader,
        },
        config::AssemblerOptions,
        emitter::{MemoryEmitter, MemorySections},
        metadata::flags::{FieldAttributes, MethodAttributes, TypeAttributes},
    };

    const VOID_STATIC: [u8; 3] = [0x00, 0x00, 0x01];
    const VOID_INSTANCE: [u8; 3] = [0x20, 0x00, 0x01];

    fn assembler(options: AssemblerOptions) -> Assembler<MemoryEmitter, MemorySections> {
        let options = AssemblerOptions {
            auto_inherit_from_object: false,
            ..options
        };
        Assembler::new(MemoryEmitter::new(), MemorySections::new(), options)
    }

    fn static_method(asm: &mut Assembler<MemoryEmitter, MemorySections>, name: &str, code: &[u16]) {
        asm.start_method(MethodHeader::new(
            name,
            VOID_STATIC.to_vec(),
            MethodAttributes::PUBLIC | MethodAttributes::STATIC,
        ))
        .unwrap();
        for &op in code {
            asm.emit_opcode(op).unwrap();
        }
        asm.end_method().unwrap();
    }

    #[test]
    fn classes_members_and_bodies() {
        let mut asm = assembler(AssemblerOptions::default());
        asm.start_class(ClassHeader::new("App.Program", TypeAttributes::PUBLIC))
            .unwrap();
        asm.add_field(FieldDecl::new(
            "count",
            vec![0x06, 0x08],
            FieldAttributes::STATIC | FieldAttributes::PRIVATE,
        ))
        .unwrap();
        static_method(&mut asm, "Main", &[opcode::NOP, opcode::RET]);
        asm.end_class().unwrap();

        let image = asm.finish().unwrap();
        let emitter = asm.emitter();

        assert_eq!(emitter.types.len(), 2);
        assert_eq!(emitter.types[0].1.name, "<Module>");
        let program = emitter.type_token("App.Program").unwrap();
        assert_eq!(program, Token(0x02000002));

        assert_eq!(image.classes.len(), 2);
        assert_eq!(image.classes[1].fields.len(), 1);
        assert_eq!(image.methods.len(), 1);
        let main = &image.methods[0];
        assert_eq!(main.owner, program);
        assert_eq!(main.body, vec![0x0A, 0x00, 0x2A]);
        assert_eq!(emitter.method_rvas.get(&main.token), Some(&main.rva));
        assert!(image.il_only);
    }

    #[test]
    fn undefined_class_reported_after_all_classes() {
        let mut asm = assembler(AssemblerOptions::default());
        let missing = asm.class_token("Lib.Missing").unwrap();
        asm.start_class(ClassHeader::new("Derived", TypeAttributes::PUBLIC).extends(missing))
            .unwrap();
        asm.end_class().unwrap();

        let err = asm.finish().unwrap_err();
        assert!(matches!(err, Error::PhaseFailed { phase: "class emission", errors: 1 }));
        assert!(asm.emitter().type_token("Derived").is_some());
        assert!(asm.diagnostics().mentions("Lib.Missing"));
    }

    #[test]
    fn folding_shares_rvas() {
        let mut asm = assembler(AssemblerOptions::optimized());
        asm.start_class(ClassHeader::new("C", TypeAttributes::PUBLIC)).unwrap();
        static_method(&mut asm, "A", &[opcode::LDNULL, opcode::POP, opcode::RET]);
        static_method(&mut asm, "B", &[opcode::LDNULL, opcode::POP, opcode::RET]);
        static_method(&mut asm, "C", &[opcode::LDNULL, opcode::NOP, opcode::RET]);
        asm.end_class().unwrap();

        let image = asm.finish().unwrap();
        let (a, b, c) = (&image.methods[0], &image.methods[1], &image.methods[2]);
        assert_eq!(a.rva, b.rva);
        assert!(!a.folded);
        assert!(b.folded);
        assert_ne!(a.rva, c.rva);
        assert!(!c.folded);
    }

    #[test]
    fn no_folding_by_default() {
        let mut asm = assembler(AssemblerOptions::default());
        static_method(&mut asm, "A", &[opcode::RET]);
        static_method(&mut asm, "B", &[opcode::RET]);

        let image = asm.finish().unwrap();
        assert_ne!(image.methods[0].rva, image.methods[1].rva);
    }

    #[test]
    fn pending_attribute_ctor_resolved_late() {
        let mut asm = assembler(AssemblerOptions::default());
        let attribute_class = asm.class_token("MarkerAttribute").unwrap();
        let ctor = asm
            .member_ref(attribute_class, ".ctor", VOID_INSTANCE.to_vec())
            .unwrap();
        assert!(ctor.is_pending());

        asm.start_class(ClassHeader::new("Target", TypeAttributes::PUBLIC)).unwrap();
        asm.declare_custom_attribute(CustomAttribute {
            ctor,
            blob: vec![0x01, 0x00, 0x00, 0x00],
        })
        .unwrap();
        asm.end_class().unwrap();

        asm.start_class(ClassHeader::new("MarkerAttribute", TypeAttributes::PUBLIC))
            .unwrap();
        asm.start_method(MethodHeader::new(
            ".ctor",
            VOID_INSTANCE.to_vec(),
            MethodAttributes::PUBLIC | MethodAttributes::SPECIAL_NAME | MethodAttributes::RTSPECIAL_NAME,
        ))
        .unwrap();
        asm.emit_opcode(opcode::RET).unwrap();
        asm.end_method().unwrap();
        asm.end_class().unwrap();

        asm.finish().unwrap();
        let emitter = asm.emitter();
        let target = emitter.type_token("Target").unwrap();
        let marker = emitter.type_token("MarkerAttribute").unwrap();
        let ctor = emitter.method_token(marker, ".ctor").unwrap();
        assert_eq!(emitter.attributes_of(target), vec![(ctor, &[1u8, 0, 0, 0][..])]);
    }

    #[test]
    fn event_accessor_must_be_a_method() {
        let mut asm = assembler(AssemblerOptions {
            continue_on_error: true,
            ..AssemblerOptions::default()
        });
        asm.start_class(ClassHeader::new("Source", TypeAttributes::PUBLIC)).unwrap();
        asm.start_event("Changed", 0, Token(0x01000001)).unwrap();
        asm.set_event_method(EventMethod::AddOn, TokenRef::Final(Token(0x04000001)))
            .unwrap();
        asm.end_event().unwrap();
        asm.end_class().unwrap();

        assert!(matches!(asm.finish(), Err(Error::CompilationFailed(1))));
        assert!(asm.emitter().events.is_empty());
        assert!(asm.diagnostics().mentions("event 'Changed'"));
    }

    #[test]
    fn explicit_offsets_in_auto_layout_class() {
        let mut asm = assembler(AssemblerOptions::default());
        asm.start_class(ClassHeader::new("Auto", TypeAttributes::PUBLIC)).unwrap();
        asm.add_field(FieldDecl::new("x", vec![0x06, 0x08], FieldAttributes::PUBLIC).with_offset(4))
            .unwrap();
        asm.end_class().unwrap();

        asm.finish().unwrap();
        assert!(asm.diagnostics().has_warnings());
        assert!(asm.emitter().class_layouts.is_empty());

        let mut strict = assembler(AssemblerOptions::strict());
        strict
            .start_class(ClassHeader::new("Auto", TypeAttributes::PUBLIC))
            .unwrap();
        strict
            .add_field(FieldDecl::new("x", vec![0x06, 0x08], FieldAttributes::PUBLIC).with_offset(4))
            .unwrap();
        strict.end_class().unwrap();
        assert!(strict.finish().is_err());
    }

    #[test]
    fn explicit_layout() {
        let mut asm = assembler(AssemblerOptions::default());
        asm.start_class(ClassHeader::new(
            "Union",
            TypeAttributes::PUBLIC | TypeAttributes::EXPLICIT_LAYOUT,
        ))
        .unwrap();
        asm.set_class_layout(Some(4), Some(8)).unwrap();
        asm.add_field(FieldDecl::new("a", vec![0x06, 0x08], FieldAttributes::PUBLIC).with_offset(0))
            .unwrap();
        asm.add_field(FieldDecl::new("b", vec![0x06, 0x0B], FieldAttributes::PUBLIC).with_offset(0))
            .unwrap();
        asm.end_class().unwrap();

        asm.finish().unwrap();
        let (class, packing, size, offsets) = &asm.emitter().class_layouts[0];
        assert_eq!(*class, asm.emitter().type_token("Union").unwrap());
        assert_eq!((*packing, *size), (4, 8));
        assert_eq!(offsets.len(), 2);
    }

    #[test]
    fn field_rva_from_data_label() {
        let mut asm = assembler(AssemblerOptions::default());
        asm.declare_data(Some("D_0"), false).unwrap();
        asm.emit_data(&[1, 0, 0, 0]).unwrap();
        asm.add_field(
            FieldDecl::new(
                "init",
                vec![0x06, 0x08],
                FieldAttributes::STATIC | FieldAttributes::HAS_FIELD_RVA,
            )
            .at("D_0"),
        )
        .unwrap();

        asm.finish().unwrap();
        let (token, _) = asm.emitter().field(Token(0x02000001), "init").unwrap();
        assert_eq!(asm.emitter().field_rvas.get(&token), asm.data_label_rva("D_0").as_ref());
    }

    #[test]
    fn edit_and_continue_passes() {
        let options = AssemblerOptions {
            auto_inherit_from_object: false,
            ..AssemblerOptions::enc()
        };
        let mut asm = Assembler::new(MemoryEmitter::with_base_module(), MemorySections::new(), options);
        asm.start_class(ClassHeader::new("Patched", TypeAttributes::PUBLIC)).unwrap();
        static_method(&mut asm, "First", &[opcode::RET]);
        asm.end_class().unwrap();

        let first = asm.finish().unwrap();
        assert_eq!(first.classes.len(), 1);
        assert_eq!(first.methods[0].rva, 4);
        assert_eq!(&first.delta_il[..4], &2u32.to_le_bytes());
        assert_eq!(&first.delta_il[4..], &[0x06, 0x2A]);
        assert!(asm.sections().data(Section::Il).is_empty());

        asm.start_class(ClassHeader::new("Patched", TypeAttributes::PUBLIC)).unwrap();
        static_method(&mut asm, "Second", &[opcode::NOP, opcode::RET]);
        asm.end_class().unwrap();

        let second = asm.finish().unwrap();
        assert!(second.classes.is_empty());
        assert_eq!(second.methods.len(), 1);
        assert_eq!(second.methods[0].name, "Second");
        assert_eq!(asm.emitter().calls("define_type"), 1);
        assert_eq!(asm.emitter().methods.len(), 2);
    }

    #[test]
    fn unclosed_method() {
        let mut asm = assembler(AssemblerOptions::default());
        asm.start_method(MethodHeader::new(
            "Dangling",
            VOID_STATIC.to_vec(),
            MethodAttributes::STATIC,
        ))
        .unwrap();
        assert!(matches!(asm.finish(), Err(Error::InvalidScope(_))));
    }
}
