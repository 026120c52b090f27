//! Scope and declaration callbacks: namespaces, classes, methods and their directives.
//!
//! These callbacks build the descriptor graph only; nothing reaches the metadata emitter
//! before [`Assembler::finish`]. Each declaration also moves the custom attribute target,
//! so a following `.custom` attaches to what was declared last.

use crate::{
    assembler::{
        class::{Class, ClassHeader, ClassId, ClassSlot, MODULE_CLASS, NESTING_SEPARATOR},
        members::{
            strip_privatescope_suffix, AttributeTarget, CustomAttribute, GenericOwner, GenericParam,
            MethodImpl, PInvokeDecl, PermissionAttribute, QueuedAttribute, SecurityDecl,
        },
        method::{LocalDecl, LocalScope, Method, MethodBuilder, MethodHeader, MethodId, Param, VarRef},
        refs::SpecialType,
        Assembler,
    },
    diagnostics::DiagnosticCategory,
    emitter::{Constant, MetadataEmitter, SectionAllocator},
    metadata::{
        flags::{FieldAttributes, MethodAttributes, MethodImplAttributes, ParamAttributes, TypeAttributes},
        signatures::{is_void_type, parse_method_header, set_has_this},
        token::{Token, TokenRef},
    },
    utils::is_valid_packing,
    Error, Result,
};

const CTOR: &str = ".ctor";
const CCTOR: &str = ".cctor";
/// Highest local variable index an instruction can encode
const MAX_LOCAL_SLOT: u32 = 0xFFFE;

impl<E: MetadataEmitter, S: SectionAllocator> Assembler<E, S> {
    /// Opens a namespace; nested namespaces are joined with `.`.
    pub fn start_namespace(&mut self, name: impl Into<String>) {
        self.namespaces.push(name.into());
    }

    /// Closes the innermost namespace.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] without an open namespace.
    pub fn end_namespace(&mut self) -> Result<()> {
        if self.namespaces.pop().is_none() {
            return self.report(Error::InvalidScope("End of namespace without start".to_string()));
        }
        Ok(())
    }

    fn qualified_class_name(&self, name: &str) -> String {
        if let Some(&encloser) = self.class_stack.last() {
            return format!("{}{}{}", self.classes.name(encloser), NESTING_SEPARATOR, name);
        }
        let mut full_name = self.namespaces.join(".");
        if !full_name.is_empty() {
            full_name.push('.');
        }
        full_name.push_str(name);
        full_name
    }

    /// Opens a `.class` block and returns the id of the class.
    ///
    /// A class that was only referenced so far is promoted to a defined class and keeps its
    /// provisional token. Re-opening a class that is already defined adds members to it
    /// without changing its attributes.
    ///
    /// # Errors
    /// Returns an error for classes inside methods, over-long names, interfaces with a base
    /// class, enums implementing interfaces and policy violations in strict mode.
    pub fn start_class(&mut self, header: ClassHeader) -> Result<ClassId> {
        if self.current.is_some() {
            self.report(Error::InvalidScope(format!(
                "Class '{}' declared inside a method",
                header.name
            )))?;
        }
        self.settle_type_param_fixups();

        let full_name = self.qualified_class_name(&header.name);
        self.check_name_length(&full_name)?;
        let id = self.classes.find_create(&full_name);

        if let Some(existing) = self.classes.get(id) {
            let flags = existing.flags;
            if header.flags & TypeAttributes::HINT_MASK != flags && header.flags != 0 {
                self.warn(
                    DiagnosticCategory::Structural,
                    format!("Attributes of re-opened class '{full_name}' ignored"),
                );
            }
            self.class_stack.push(id);
            self.target = AttributeTarget::Class(id);
            return Ok(id);
        }

        let nested = !self.class_stack.is_empty();
        let encloser = self.class_stack.last().copied();
        let mut flags = header.flags & TypeAttributes::HINT_MASK;
        let enum_hint = header.flags & TypeAttributes::ENUM_HINT != 0;
        let value_hint = enum_hint || header.flags & TypeAttributes::VALUE_HINT != 0;

        let visibility = flags & TypeAttributes::VISIBILITY_MASK;
        if nested && visibility <= TypeAttributes::PUBLIC {
            self.policy(format!("Nested class '{full_name}' with non-nested visibility, corrected"))?;
            let corrected = if visibility == TypeAttributes::PUBLIC {
                TypeAttributes::NESTED_PUBLIC
            } else {
                TypeAttributes::NESTED_PRIVATE
            };
            flags = (flags & !TypeAttributes::VISIBILITY_MASK) | corrected;
        } else if !nested && visibility > TypeAttributes::PUBLIC {
            self.policy(format!("Non-nested class '{full_name}' with nested visibility, corrected"))?;
            let corrected = if visibility == TypeAttributes::NESTED_PUBLIC {
                TypeAttributes::PUBLIC
            } else {
                TypeAttributes::NOT_PUBLIC
            };
            flags = (flags & !TypeAttributes::VISIBILITY_MASK) | corrected;
        }

        let is_interface = flags & TypeAttributes::INTERFACE != 0;
        let mut extends = header.extends;
        if is_interface {
            if extends.take().is_some() {
                self.report(Error::Policy(format!("Interface '{full_name}' has a base class")))?;
            }
            flags |= TypeAttributes::ABSTRACT;
        }

        let base_kind = extends.and_then(|token| self.special.kind_of(token));
        let is_core_base = self.options.is_core_library && full_name == SpecialType::Enum.to_string();
        let is_enum = enum_hint || (base_kind == Some(SpecialType::Enum) && !is_core_base);
        let is_value_type = is_enum || value_hint || (base_kind == Some(SpecialType::ValueType) && !is_core_base);

        if extends.is_none() && !is_interface && self.options.auto_inherit_from_object {
            let base = if is_enum {
                Some(SpecialType::Enum)
            } else if is_value_type {
                Some(SpecialType::ValueType)
            } else if full_name != SpecialType::Object.to_string() {
                Some(SpecialType::Object)
            } else {
                None
            };
            if let Some(base) = base {
                extends = Some(self.special_type(base)?);
            }
        }

        if is_value_type && flags & TypeAttributes::SEALED == 0 {
            self.policy(format!("Non-sealed value class '{full_name}' made sealed"))?;
            flags |= TypeAttributes::SEALED;
        }
        if is_enum && !header.implements.is_empty() {
            self.report(Error::Policy(format!("Enum '{full_name}' implements interfaces")))?;
        }

        let token = self
            .classes
            .slot(id)
            .map_or_else(|| crate::assembler::ClassTable::token_for(id), ClassSlot::token);
        let mut class = Class::new(&full_name, token, flags, encloser);
        class.extends = extends;
        class.implements = header.implements;
        class.generic_params = header.generic_params.into_iter().map(GenericParam::from).collect();
        class.is_value_type = is_value_type;
        class.is_enum = is_enum;
        class.line = self.source.line;
        log::debug!("class '{full_name}' declared as {token}");

        self.classes.define(id, class);
        self.class_stack.push(id);
        self.target = AttributeTarget::Class(id);
        Ok(id)
    }

    /// Closes the innermost `.class` block.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] without an open class or inside a method.
    pub fn end_class(&mut self) -> Result<()> {
        if self.current.is_some() {
            return self.report(Error::InvalidScope("End of class inside a method".to_string()));
        }
        if self.class_stack.pop().is_none() {
            return self.report(Error::InvalidScope("End of class without start".to_string()));
        }
        self.current_event = None;
        self.current_property = None;
        self.target = match self.class_stack.last() {
            Some(&id) => AttributeTarget::Class(id),
            None => AttributeTarget::Module,
        };
        Ok(())
    }

    /// Opens a `.method` block in the current class, or a global method outside of classes.
    ///
    /// # Errors
    /// Returns an error for methods inside methods, duplicates, abstract methods in
    /// non-abstract classes, methods of enums, instance constructors of interfaces,
    /// unsupported implementation kinds and policy violations in strict mode.
    pub fn start_method(&mut self, header: MethodHeader) -> Result<MethodId> {
        if self.current.is_some() {
            self.report(Error::InvalidScope(format!(
                "Method '{}' declared inside a method",
                header.name
            )))?;
            self.current = None;
        }
        self.settle_type_param_fixups();
        self.check_name_length(&header.name)?;

        let class_id = self.current_class();
        let class = self.classes.get(class_id).ok_or_else(|| {
            Error::UndefinedClass(self.classes.name(class_id).to_string())
        })?;
        let class_name = class.full_name.clone();
        let (class_is_abstract, class_is_interface, class_is_enum) =
            (class.is_abstract(), class.is_interface(), class.is_enum);

        let mut flags = header.flags;
        let mut impl_flags = header.impl_flags;
        let mut signature = header.signature;
        let is_privatescope = flags & MethodAttributes::MEMBER_ACCESS_MASK == MethodAttributes::PRIVATE_SCOPE;
        let name = if is_privatescope {
            strip_privatescope_suffix(&header.name).to_string()
        } else {
            header.name
        };

        if class_id == MODULE_CLASS {
            if flags & MethodAttributes::STATIC == 0 {
                self.policy(format!("Non-static global method '{name}', made static"))?;
                flags |= MethodAttributes::STATIC;
            }
            if flags & MethodAttributes::ABSTRACT != 0 {
                self.policy(format!("Global method '{name}' cannot be abstract, flag removed"))?;
                flags &= !MethodAttributes::ABSTRACT;
            }
        }
        if class_is_enum {
            self.report(Error::Policy(format!("Method '{name}' declared in enum '{class_name}'")))?;
        }
        if flags & MethodAttributes::ABSTRACT != 0 && !class_is_abstract {
            self.report(Error::Policy(format!(
                "Abstract method '{name}' in non-abstract class '{class_name}'"
            )))?;
        }
        if name == CTOR || name == CCTOR {
            flags |= MethodAttributes::SPECIAL_NAME | MethodAttributes::RTSPECIAL_NAME;
            if name == CTOR && class_is_interface {
                self.report(Error::Policy(format!("Instance constructor in interface '{class_name}'")))?;
            }
        }

        let convention = parse_method_header(&signature)?;
        let is_static = flags & MethodAttributes::STATIC != 0;
        if is_static && convention.has_this() {
            self.policy(format!("Static method '{name}' has an instance calling convention, corrected"))?;
            set_has_this(&mut signature, false);
        } else if !is_static && !convention.has_this() {
            self.policy(format!("Instance method '{name}' lacks the instance calling convention, corrected"))?;
            set_has_this(&mut signature, true);
        }

        let code_type = impl_flags & MethodImplAttributes::CODE_TYPE_MASK;
        if code_type == MethodImplAttributes::NATIVE
            || code_type == MethodImplAttributes::OPTIL
            || impl_flags & MethodImplAttributes::UNMANAGED != 0
        {
            self.report(Error::Policy(format!(
                "Method '{name}': native, OPTIL and unmanaged implementations are not supported"
            )))?;
            impl_flags &= !(MethodImplAttributes::CODE_TYPE_MASK | MethodImplAttributes::UNMANAGED);
        }

        if let Some(pinvoke) = &header.pinvoke {
            if pinvoke.dll.is_empty() {
                self.report(Error::Policy(format!("P/Invoke of method '{name}' without a library")))?;
            }
            flags |= MethodAttributes::PINVOKE_IMPL;
        }

        let has_this = !is_static;
        let arg_names: Vec<String> = header.params.iter().map(|p| p.name.clone()).collect();

        if !is_privatescope {
            if let Some(existing) = self.find_declared_method(class_id, &name, &signature) {
                if self.options.tolerate_duplicate_methods {
                    self.warn(
                        DiagnosticCategory::Structural,
                        format!("Duplicate method '{class_name}::{name}', body reset"),
                    );
                    if self.entry_point == Some(existing) {
                        self.entry_point = None;
                    }
                    if let Some(method) = self.methods.get_mut(existing) {
                        method.body = None;
                        method.sequence_points.clear();
                        method.has_new_body = false;
                    }
                    self.current = Some(MethodBuilder::new(existing, arg_names, has_this));
                    self.target = AttributeTarget::Method(existing);
                    return Ok(existing);
                }
                self.report(Error::Duplicate {
                    kind: "method",
                    name: format!("{class_name}::{name}"),
                })?;
            }
        }

        let mut return_param = header.return_param.map(Param::from).unwrap_or_default();
        return_param.name.clear();
        let params = header
            .params
            .into_iter()
            .map(|decl| {
                let mut param = Param::from(decl);
                if param.constant.is_some() {
                    param.flags |= ParamAttributes::HAS_DEFAULT;
                }
                if param.marshal.is_some() {
                    param.flags |= ParamAttributes::HAS_FIELD_MARSHAL;
                }
                param
            })
            .collect();

        let method = Method {
            name,
            class: class_id,
            signature,
            flags,
            impl_flags,
            params,
            return_param,
            generic_params: header.generic_params.into_iter().map(GenericParam::from).collect(),
            pinvoke: header.pinvoke,
            security: Vec::new(),
            custom_attributes: Vec::new(),
            token: Token::NIL,
            is_new: true,
            has_new_body: false,
            body: None,
            sequence_points: Vec::new(),
            rva: None,
            folded: false,
            line: self.source.line,
        };
        log::trace!("method '{}::{}' opened", class_name, method.name);

        self.methods.push(method);
        let id = self.methods.len() - 1;
        self.class_mut(class_id)?.methods.push(id);
        self.current = Some(MethodBuilder::new(id, arg_names, has_this));
        self.target = AttributeTarget::Method(id);
        Ok(id)
    }

    fn find_declared_method(&self, class: ClassId, name: &str, signature: &[u8]) -> Option<MethodId> {
        self.classes.get(class)?.methods.iter().copied().find(|&id| {
            self.methods.get(id).is_some_and(|method| {
                method.name == name
                    && method.signature == signature
                    && method.flags & MethodAttributes::MEMBER_ACCESS_MASK
                        != MethodAttributes::PRIVATE_SCOPE
            })
        })
    }

    /// Closes the `.method` block and assembles its body.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] without an open method, and any error of the body
    /// assembly (undefined labels, out-of-range short branches, invalid exception clauses,
    /// invalid locals).
    pub fn end_method(&mut self) -> Result<()> {
        let Some(builder) = self.current.take() else {
            return self.report(Error::InvalidScope("End of method without start".to_string()));
        };
        self.target = AttributeTarget::Class(self.current_class());
        self.assemble_body(builder)
    }

    pub(crate) fn builder_mut(&mut self, directive: &str) -> Result<Option<&mut MethodBuilder>> {
        if self.current.is_none() {
            self.report(Error::InvalidScope(format!("{directive} outside of a method")))?;
        }
        Ok(self.current.as_mut())
    }

    /// Marks the current method as the entry point (`.entrypoint`).
    ///
    /// # Errors
    /// Returns [`Error::InvalidEntryPoint`] for instance methods and outside of methods, and
    /// [`Error::Duplicate`] when an entry point was already declared.
    pub fn emit_entry_point(&mut self) -> Result<()> {
        let Some(id) = self.current.as_ref().map(|builder| builder.id) else {
            return self.report(Error::InvalidEntryPoint(
                ".entrypoint outside of a method".to_string(),
            ));
        };
        let (name, is_static) = match self.methods.get(id) {
            Some(method) => (method.name.clone(), method.is_static()),
            None => return Err(Error::OutOfBounds),
        };
        if !is_static {
            return self.report(Error::InvalidEntryPoint(format!(
                "Entry point '{name}' is not static"
            )));
        }
        if self.entry_point.is_some() {
            return self.report(Error::Duplicate {
                kind: "entry point",
                name,
            });
        }
        self.entry_point = Some(id);
        Ok(())
    }

    /// Sets the maximum stack depth of the current method (`.maxstack`).
    ///
    /// Values above 65535 are truncated with a warning.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of a method.
    pub fn emit_max_stack(&mut self, value: u32) -> Result<()> {
        if value > u32::from(u16::MAX) {
            self.warn(
                DiagnosticCategory::Policy,
                format!(".maxstack {value} truncated to 16 bits"),
            );
        }
        if let Some(builder) = self.builder_mut(".maxstack")? {
            builder.max_stack = value as u16;
        }
        Ok(())
    }

    /// Requests zero-initialized locals for the current method (`.zeroinit`).
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of a method.
    pub fn emit_zero_init(&mut self) -> Result<()> {
        if let Some(builder) = self.builder_mut(".zeroinit")? {
            builder.init_locals = true;
        }
        Ok(())
    }

    /// Declares local variables (`.locals`).
    ///
    /// Locals without an explicit slot take the next free slot. Names are visible in the
    /// innermost open scope.
    ///
    /// # Errors
    /// Returns [`Error::InvalidLocal`] for untyped or `void` locals, for slots above
    /// `0xFFFE` and for a slot declared again with a different type.
    pub fn declare_locals(&mut self, locals: Vec<LocalDecl>, init: bool) -> Result<()> {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        {
            let Some(builder) = self.builder_mut(".locals")? else {
                return Ok(());
            };
            if init {
                builder.init_locals = true;
            }

            for local in locals {
                let label = local.name.clone().unwrap_or_default();
                if local.ty.is_empty() || is_void_type(&local.ty).unwrap_or(true) {
                    errors.push(Error::InvalidLocal(format!("Local '{label}' has no valid type")));
                    continue;
                }

                let slot = local.slot.unwrap_or(builder.locals.len() as u32);
                if slot > MAX_LOCAL_SLOT {
                    errors.push(Error::InvalidLocal(format!(
                        "Local '{label}' slot {slot} exceeds {MAX_LOCAL_SLOT:#X}"
                    )));
                    continue;
                }
                let index = slot as usize;
                if index >= builder.locals.len() {
                    builder.locals.resize(index + 1, None);
                }
                match &builder.locals[index] {
                    Some(existing) if *existing == local.ty => {
                        warnings.push(format!("Local slot {slot} is already in use"));
                    }
                    Some(_) => {
                        errors.push(Error::InvalidLocal(format!(
                            "Local slot {slot} redeclared with a different type"
                        )));
                        continue;
                    }
                    None => builder.locals[index] = Some(local.ty),
                }

                if let Some(name) = local.name {
                    let scope = builder.open_scopes.last().copied().unwrap_or(0);
                    if let Some(scope) = builder.scopes.get_mut(scope) {
                        scope.names.insert(name, slot);
                    }
                }
            }
        }

        for warning in warnings {
            self.warn(DiagnosticCategory::Structural, warning);
        }
        self.report_all(errors)
    }

    /// Opens a lexical scope for local names (`{`).
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of a method.
    pub fn open_scope(&mut self) -> Result<()> {
        if let Some(builder) = self.builder_mut("Scope")? {
            let start = builder.position();
            builder.scopes.push(LocalScope {
                start,
                ..LocalScope::default()
            });
            let index = builder.scopes.len() - 1;
            builder.open_scopes.push(index);
        }
        Ok(())
    }

    /// Closes the innermost lexical scope (`}`).
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of a method or without an open scope.
    pub fn close_scope(&mut self) -> Result<()> {
        let closed = match self.builder_mut("Scope")? {
            Some(builder) if builder.open_scopes.len() > 1 => {
                let end = builder.position();
                if let Some(scope) = builder
                    .open_scopes
                    .pop()
                    .and_then(|index| builder.scopes.get_mut(index))
                {
                    scope.end = Some(end);
                }
                true
            }
            Some(_) => false,
            None => true,
        };
        if !closed {
            return self.report(Error::InvalidScope("Scope closed without opening".to_string()));
        }
        Ok(())
    }

    /// Sets packing and size of the current class (`.pack`, `.size`).
    ///
    /// # Errors
    /// Returns [`Error::InvalidPacking`] unless the packing is a power of two in `[1, 128]`.
    pub fn set_class_layout(&mut self, packing: Option<u32>, size: Option<u32>) -> Result<()> {
        if self.class_stack.is_empty() || self.current.is_some() {
            return self.report(Error::InvalidScope(
                "Class layout outside of a class".to_string(),
            ));
        }
        if let Some(packing) = packing.filter(|&p| !is_valid_packing(p) && p != 0) {
            return self.report(Error::InvalidPacking(packing));
        }
        let class = self.class_mut(self.current_class())?;
        if packing.is_some() {
            class.packing = packing;
        }
        if size.is_some() {
            class.size = size;
        }
        Ok(())
    }

    /// Selects a parameter of the current method as attribute target (`.param [n]`),
    /// optionally setting its default value. Index 0 is the return value.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of a method or for an index past the
    /// signature's parameter count.
    pub fn select_param(&mut self, index: u16, constant: Option<Constant>) -> Result<()> {
        let Some(id) = self.current.as_ref().map(|builder| builder.id) else {
            return self.report(Error::InvalidScope(".param outside of a method".to_string()));
        };
        let method = self.methods.get_mut(id).ok_or(Error::OutOfBounds)?;
        let count = parse_method_header(&method.signature)?.param_count;
        if u32::from(index) > count {
            let name = method.name.clone();
            return self.report(Error::InvalidScope(format!(
                "Parameter {index} of method '{name}' out of range"
            )));
        }

        let param = if index == 0 {
            &mut method.return_param
        } else {
            let position = usize::from(index) - 1;
            if method.params.len() <= position {
                method.params.resize_with(position + 1, Param::default);
            }
            &mut method.params[position]
        };
        if let Some(constant) = constant {
            param.constant = Some(constant);
            param.flags |= ParamAttributes::HAS_DEFAULT;
        }
        self.target = AttributeTarget::Param(id, index);
        Ok(())
    }

    fn current_generic_owner(&self) -> Option<GenericOwner> {
        self.generic_owner(self.current.is_some())
    }

    pub(crate) fn generic_params_of(&mut self, owner: GenericOwner) -> Option<&mut Vec<GenericParam>> {
        match owner {
            GenericOwner::Class(id) => self.classes.get_mut(id).map(|class| &mut class.generic_params),
            GenericOwner::Method(id) => self.methods.get_mut(id).map(|method| &mut method.generic_params),
        }
    }

    fn generic_param_position(&mut self, param: &VarRef) -> Result<Option<(GenericOwner, usize)>> {
        let Some(owner) = self.current_generic_owner() else {
            self.report(Error::InvalidScope(
                ".param type outside of a class or method".to_string(),
            ))?;
            return Ok(None);
        };
        let params = self.generic_params_of(owner).map(|params| &*params);
        let index = match param {
            VarRef::Index(index) => params
                .filter(|params| (*index as usize) < params.len())
                .map(|_| *index as usize),
            VarRef::Name(name) => params.and_then(|params| params.iter().position(|p| p.name == *name)),
        };
        match index {
            Some(index) => Ok(Some((owner, index))),
            None => {
                let name = match param {
                    VarRef::Index(index) => index.to_string(),
                    VarRef::Name(name) => name.clone(),
                };
                self.report(Error::UndefinedGenericParam(name))?;
                Ok(None)
            }
        }
    }

    /// Selects a generic parameter of the current method or class as attribute target
    /// (`.param type`).
    ///
    /// # Errors
    /// Returns [`Error::UndefinedGenericParam`] for unknown parameters.
    pub fn select_type_param(&mut self, param: VarRef) -> Result<()> {
        if let Some((owner, index)) = self.generic_param_position(&param)? {
            self.target = AttributeTarget::GenericParam(owner, index);
        }
        Ok(())
    }

    /// Selects a constraint of a generic parameter as attribute target
    /// (`.param constraint`).
    ///
    /// # Errors
    /// Returns [`Error::UndefinedGenericParam`] for unknown parameters and
    /// [`Error::UndefinedReference`] if the parameter has no such constraint.
    pub fn select_type_param_constraint(&mut self, param: VarRef, constraint: Token) -> Result<()> {
        let Some((owner, index)) = self.generic_param_position(&param)? else {
            return Ok(());
        };
        let position = self
            .generic_params_of(owner)
            .and_then(|params| params.get(index))
            .and_then(|p| p.constraints.iter().position(|&c| c == constraint));
        match position {
            Some(position) => {
                self.target = AttributeTarget::Constraint(owner, index, position);
                Ok(())
            }
            None => self.report(Error::UndefinedReference(format!(
                "Generic parameter has no constraint {constraint}"
            ))),
        }
    }

    /// Attaches a custom attribute to the current target (`.custom`).
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] when there is nothing to attach to.
    pub fn declare_custom_attribute(&mut self, attribute: CustomAttribute) -> Result<()> {
        let owner_token = self.target_token();
        if let Some(owner) = owner_token.filter(|token| !token.is_null()) {
            // Already emitted by an earlier pass
            self.queue_attribute(TokenRef::Final(owner), attribute);
            return Ok(());
        }

        let target = self.target;
        let slot = match target {
            AttributeTarget::None => None,
            AttributeTarget::Module => Some(&mut self.module_attributes),
            AttributeTarget::Class(id) => self.classes.get_mut(id).map(|c| &mut c.custom_attributes),
            AttributeTarget::Method(id) => self.methods.get_mut(id).map(|m| &mut m.custom_attributes),
            AttributeTarget::Param(id, index) => self.methods.get_mut(id).and_then(|m| {
                if index == 0 {
                    Some(&mut m.return_param.custom_attributes)
                } else {
                    m.params.get_mut(usize::from(index) - 1).map(|p| &mut p.custom_attributes)
                }
            }),
            AttributeTarget::Field(class, index) => self
                .classes
                .get_mut(class)
                .and_then(|c| c.fields.get_mut(index))
                .map(|f| &mut f.custom_attributes),
            AttributeTarget::Event(class, index) => self
                .classes
                .get_mut(class)
                .and_then(|c| c.events.get_mut(index))
                .map(|e| &mut e.custom_attributes),
            AttributeTarget::Property(class, index) => self
                .classes
                .get_mut(class)
                .and_then(|c| c.properties.get_mut(index))
                .map(|p| &mut p.custom_attributes),
            AttributeTarget::GenericParam(owner, index) => self
                .generic_params_of(owner)
                .and_then(|params| params.get_mut(index))
                .map(|p| &mut p.custom_attributes),
            AttributeTarget::Constraint(owner, index, constraint) => {
                if let Some(param) = self.generic_params_of(owner).and_then(|params| params.get_mut(index)) {
                    param.constraint_attributes.push((constraint, attribute));
                    return Ok(());
                }
                None
            }
            AttributeTarget::Assembly => self.manifest.assembly.as_mut().map(|a| &mut a.custom_attributes),
            AttributeTarget::AssemblyRef(index) => self
                .manifest
                .assembly_refs
                .get_mut(index)
                .map(|a| &mut a.custom_attributes),
            AttributeTarget::File(index) => self.manifest.files.get_mut(index).map(|f| &mut f.custom_attributes),
            AttributeTarget::ComType(index) => self
                .manifest
                .com_types
                .get_mut(index)
                .map(|c| &mut c.custom_attributes),
            AttributeTarget::Resource(index) => self
                .manifest
                .resources
                .get_mut(index)
                .map(|r| &mut r.custom_attributes),
        };

        match slot {
            Some(attributes) => {
                attributes.push(attribute);
                Ok(())
            }
            None => self.report(Error::InvalidScope(
                "Custom attribute without a valid owner".to_string(),
            )),
        }
    }

    /// Attaches a custom attribute to an explicit owner (`.custom (owner) ...`).
    ///
    /// The attribute is emitted after the manifest, once every local reference is resolved.
    pub fn declare_custom_attribute_for(&mut self, owner: TokenRef, attribute: CustomAttribute) {
        self.queue_attribute(owner, attribute);
    }

    fn queue_attribute(&mut self, owner: TokenRef, attribute: CustomAttribute) {
        self.attribute_queue.push(QueuedAttribute {
            owner,
            attribute,
            line: self.source.line,
        });
    }

    /// Token of the current target if it was emitted by an earlier pass.
    fn target_token(&self) -> Option<Token> {
        match self.target {
            AttributeTarget::Class(id) => self.classes.get(id).filter(|c| !c.is_new).map(|c| c.token),
            AttributeTarget::Method(id) => self.methods.get(id).filter(|m| !m.is_new).map(|m| m.token),
            AttributeTarget::Field(class, index) => self
                .classes
                .get(class)
                .and_then(|c| c.fields.get(index))
                .filter(|f| !f.is_new)
                .map(|f| f.token),
            AttributeTarget::Event(class, index) => self
                .classes
                .get(class)
                .and_then(|c| c.events.get(index))
                .filter(|e| !e.is_new)
                .map(|e| e.token),
            AttributeTarget::Property(class, index) => self
                .classes
                .get(class)
                .and_then(|c| c.properties.get(index))
                .filter(|p| !p.is_new)
                .map(|p| p.token),
            AttributeTarget::Param(id, index) => self.methods.get(id).and_then(|m| {
                if index == 0 {
                    Some(m.return_param.token)
                } else {
                    m.params.get(usize::from(index) - 1).map(|p| p.token)
                }
            }),
            AttributeTarget::AssemblyRef(index) => self.manifest.assembly_refs.get(index).map(|a| a.token),
            _ => None,
        }
    }

    fn security_slot(&mut self) -> Result<Option<&mut Vec<SecurityDecl>>> {
        if let Some(id) = self.current.as_ref().map(|builder| builder.id) {
            let method = self.methods.get_mut(id).ok_or(Error::OutOfBounds)?;
            method.flags |= MethodAttributes::HAS_SECURITY;
            return Ok(Some(&mut method.security));
        }
        if self.target == AttributeTarget::Assembly {
            return Ok(self.manifest.assembly.as_mut().map(|a| &mut a.security));
        }
        if !self.class_stack.is_empty() {
            let class = self.class_mut(self.current_class())?;
            class.flags |= TypeAttributes::HAS_SECURITY;
            return Ok(Some(&mut class.security));
        }
        self.report(Error::InvalidScope(
            "Security declaration outside of a method, class or assembly".to_string(),
        ))?;
        Ok(None)
    }

    /// Declares one permission for `action` (`.permission`).
    ///
    /// Permissions of the same action are collected into one permission set.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of a method, class or assembly.
    pub fn declare_permission(&mut self, action: u16, permission: PermissionAttribute) -> Result<()> {
        let Some(security) = self.security_slot()? else {
            return Ok(());
        };
        match security.iter_mut().find(|decl| decl.action == action && decl.raw.is_none()) {
            Some(decl) => decl.permissions.push(permission),
            None => security.push(SecurityDecl {
                action,
                permissions: vec![permission],
                raw: None,
            }),
        }
        Ok(())
    }

    /// Declares a complete permission set blob for `action` (`.permissionset`).
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of a method, class or assembly.
    pub fn declare_permission_set(&mut self, action: u16, blob: Vec<u8>) -> Result<()> {
        if let Some(security) = self.security_slot()? {
            security.push(SecurityDecl {
                action,
                permissions: Vec::new(),
                raw: Some(blob),
            });
        }
        Ok(())
    }

    /// Imports the current method or field from an unmanaged library (`pinvokeimpl`).
    ///
    /// # Errors
    /// Returns an error for an empty library name or when no method or field is selected.
    pub fn set_pinvoke(&mut self, pinvoke: PInvokeDecl) -> Result<()> {
        if pinvoke.dll.is_empty() {
            return self.report(Error::Policy("P/Invoke without a library name".to_string()));
        }
        match self.target {
            AttributeTarget::Method(id) => {
                let method = self.methods.get_mut(id).ok_or(Error::OutOfBounds)?;
                method.flags |= MethodAttributes::PINVOKE_IMPL;
                method.pinvoke = Some(pinvoke);
                Ok(())
            }
            AttributeTarget::Field(class, index) => {
                let field = self
                    .class_mut(class)?
                    .fields
                    .get_mut(index)
                    .ok_or(Error::OutOfBounds)?;
                field.flags |= FieldAttributes::PINVOKE_IMPL;
                field.pinvoke = Some(pinvoke);
                Ok(())
            }
            _ => self.report(Error::InvalidScope(
                "P/Invoke outside of a method or field".to_string(),
            )),
        }
    }

    /// Declares that `body` implements `declaration` (`.override`).
    ///
    /// Inside a method `body` is ignored and the current method is the implementation.
    ///
    /// # Errors
    /// Returns [`Error::InvalidScope`] outside of a class, or in class scope without a body.
    pub fn declare_override(&mut self, body: Option<TokenRef>, declaration: TokenRef) -> Result<()> {
        if self.class_stack.is_empty() {
            return self.report(Error::InvalidScope(".override outside of a class".to_string()));
        }
        let class_id = self.current_class();

        let body = match self.current.as_ref().map(|builder| builder.id) {
            Some(id) => {
                let (name, signature) = match self.methods.get(id) {
                    Some(method) => (method.name.clone(), method.signature.clone()),
                    None => return Err(Error::OutOfBounds),
                };
                let class_token = self.classes.slot(class_id).map_or(Token::NIL, ClassSlot::token);
                self.member_ref(class_token, &name, signature)?
            }
            None => match body {
                Some(body) => body,
                None => {
                    return self.report(Error::InvalidScope(
                        ".override in class scope needs an implementing method".to_string(),
                    ))
                }
            },
        };

        self.class_mut(class_id)?.method_impls.push(MethodImpl {
            body,
            declaration,
            is_new: true,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        assembler::{ClassHeader, LocalDecl, MethodHeader, VarRef},
        config::AssemblerOptions,
        emitter::{MemoryEmitter, MemorySections},
        metadata::flags::{MethodAttributes, TypeAttributes},
        Assembler, Error,
    };

    fn assembler(options: AssemblerOptions) -> Assembler<MemoryEmitter, MemorySections> {
        Assembler::new(MemoryEmitter::new(), MemorySections::new(), options)
    }

    const STATIC_VOID: [u8; 3] = [0x00, 0x00, 0x01];

    #[test]
    fn namespaces_and_nesting() {
        let mut asm = assembler(AssemblerOptions::default());
        asm.start_namespace("Outer");
        asm.start_namespace("Inner");
        let outer = asm.start_class(ClassHeader::new("A", TypeAttributes::PUBLIC)).unwrap();
        let nested = asm.start_class(ClassHeader::new("B", TypeAttributes::PUBLIC)).unwrap();
        asm.end_class().unwrap();
        asm.end_class().unwrap();
        asm.end_namespace().unwrap();
        asm.end_namespace().unwrap();

        assert_eq!(asm.classes().name(outer), "Outer.Inner.A");
        assert_eq!(asm.classes().name(nested), "Outer.Inner.A/B");
        let b = asm.classes().get(nested).unwrap();
        assert_eq!(b.flags & TypeAttributes::VISIBILITY_MASK, TypeAttributes::NESTED_PUBLIC);
        assert!(asm.diagnostics().has_warnings());
        assert!(asm.end_namespace().is_err());
    }

    #[test]
    fn value_types_are_sealed() {
        let mut asm = assembler(AssemblerOptions::default());
        let id = asm
            .start_class(ClassHeader::new("Point", TypeAttributes::PUBLIC | TypeAttributes::VALUE_HINT))
            .unwrap();
        let class = asm.classes().get(id).unwrap();
        assert!(class.is_value_type);
        assert_ne!(class.flags & TypeAttributes::SEALED, 0);
        assert_eq!(class.flags & TypeAttributes::VALUE_HINT, 0);

        let mut strict = assembler(AssemblerOptions::strict());
        let result = strict.start_class(ClassHeader::new("Point", TypeAttributes::PUBLIC | TypeAttributes::VALUE_HINT));
        assert!(matches!(result, Err(Error::Policy(_))));
    }

    #[test]
    fn interface_with_base_class() {
        let mut asm = assembler(AssemblerOptions::default());
        let base = asm.class_token("Base").unwrap();
        let header = ClassHeader::new("IThing", TypeAttributes::PUBLIC | TypeAttributes::INTERFACE).extends(base);
        assert!(matches!(asm.start_class(header), Err(Error::Policy(_))));
    }

    #[test]
    fn reopened_class_keeps_attributes() {
        let mut asm = assembler(AssemblerOptions::default());
        let first = asm.start_class(ClassHeader::new("C", TypeAttributes::PUBLIC)).unwrap();
        asm.end_class().unwrap();
        let second = asm.start_class(ClassHeader::new("C", TypeAttributes::NOT_PUBLIC)).unwrap();
        assert_eq!(first, second);
        assert_eq!(asm.classes().get(first).unwrap().flags & TypeAttributes::VISIBILITY_MASK, TypeAttributes::PUBLIC);
    }

    #[test]
    fn method_rules() {
        let mut asm = assembler(AssemblerOptions::default());
        asm.start_class(ClassHeader::new("C", TypeAttributes::PUBLIC)).unwrap();

        let abstract_method = MethodHeader::new("M", vec![0x20, 0x00, 0x01], MethodAttributes::ABSTRACT | MethodAttributes::VIRTUAL);
        assert!(matches!(asm.start_method(abstract_method), Err(Error::Policy(_))));

        let ctor = asm
            .start_method(MethodHeader::new(".ctor", vec![0x20, 0x00, 0x01], MethodAttributes::PUBLIC))
            .unwrap();
        assert!(asm.start_method(MethodHeader::new("Inner", STATIC_VOID.to_vec(), MethodAttributes::STATIC)).is_err());
        let flags = asm.method(ctor).unwrap().flags;
        assert_ne!(flags & MethodAttributes::RTSPECIAL_NAME, 0);
    }

    #[test]
    fn static_signature_normalized() {
        let mut asm = assembler(AssemblerOptions::default());
        asm.start_class(ClassHeader::new("C", TypeAttributes::PUBLIC)).unwrap();
        let id = asm
            .start_method(MethodHeader::new("S", vec![0x20, 0x00, 0x01], MethodAttributes::STATIC))
            .unwrap();
        assert_eq!(asm.method(id).unwrap().signature, STATIC_VOID.to_vec());
    }

    #[test]
    fn duplicate_methods() {
        let mut asm = assembler(AssemblerOptions::default());
        asm.start_class(ClassHeader::new("C", TypeAttributes::PUBLIC)).unwrap();
        asm.start_method(MethodHeader::new("M", STATIC_VOID.to_vec(), MethodAttributes::STATIC)).unwrap();
        asm.end_method().unwrap();
        let duplicate = asm.start_method(MethodHeader::new("M", STATIC_VOID.to_vec(), MethodAttributes::STATIC));
        assert!(matches!(duplicate, Err(Error::Duplicate { kind: "method", .. })));

        let options = AssemblerOptions {
            tolerate_duplicate_methods: true,
            ..AssemblerOptions::default()
        };
        let mut tolerant = assembler(options);
        tolerant.start_class(ClassHeader::new("C", TypeAttributes::PUBLIC)).unwrap();
        let first = tolerant.start_method(MethodHeader::new("M", STATIC_VOID.to_vec(), MethodAttributes::STATIC)).unwrap();
        tolerant.emit_entry_point().unwrap();
        tolerant.end_method().unwrap();
        let again = tolerant.start_method(MethodHeader::new("M", STATIC_VOID.to_vec(), MethodAttributes::STATIC)).unwrap();
        assert_eq!(first, again);
        assert!(tolerant.entry_point.is_none());
    }

    #[test]
    fn entry_point_rules() {
        let mut asm = assembler(AssemblerOptions::default());
        assert!(matches!(asm.emit_entry_point(), Err(Error::InvalidEntryPoint(_))));

        asm.start_class(ClassHeader::new("C", TypeAttributes::PUBLIC)).unwrap();
        asm.start_method(MethodHeader::new("I", vec![0x20, 0x00, 0x01], MethodAttributes::PUBLIC)).unwrap();
        assert!(matches!(asm.emit_entry_point(), Err(Error::InvalidEntryPoint(_))));
    }

    #[test]
    fn locals_and_scopes() {
        let mut asm = assembler(AssemblerOptions::default());
        asm.start_method(MethodHeader::new("M", STATIC_VOID.to_vec(), MethodAttributes::STATIC)).unwrap();
        asm.declare_locals(vec![LocalDecl::new("a", vec![0x08]), LocalDecl::new("b", vec![0x0E])], true).unwrap();
        asm.open_scope().unwrap();
        asm.declare_locals(vec![LocalDecl::new("a", vec![0x0A]).at_slot(3)], false).unwrap();

        let builder = asm.current.as_ref().unwrap();
        assert_eq!(builder.local_slot("a"), Some(3));
        assert_eq!(builder.local_slot("b"), Some(1));
        assert_eq!(builder.locals.len(), 4);
        assert!(builder.locals[2].is_none());
        assert!(builder.init_locals);

        asm.close_scope().unwrap();
        assert_eq!(asm.current.as_ref().unwrap().local_slot("a"), Some(0));
        assert!(asm.close_scope().is_err());

        let conflict = asm.declare_locals(vec![LocalDecl::new("c", vec![0x0C]).at_slot(0)], false);
        assert!(matches!(conflict, Err(Error::InvalidLocal(_))));
        let void = asm.declare_locals(vec![LocalDecl::new("v", vec![0x01])], false);
        assert!(matches!(void, Err(Error::InvalidLocal(_))));
    }

    #[test]
    fn directives_outside_methods() {
        let mut asm = assembler(AssemblerOptions::default());
        assert!(matches!(asm.emit_max_stack(8), Err(Error::InvalidScope(_))));
        assert!(matches!(asm.emit_zero_init(), Err(Error::InvalidScope(_))));
        assert!(matches!(asm.set_class_layout(Some(4), None), Err(Error::InvalidScope(_))));
    }

    #[test]
    fn packing_validation() {
        let mut asm = assembler(AssemblerOptions::default());
        asm.start_class(ClassHeader::new("S", TypeAttributes::PUBLIC | TypeAttributes::SEQUENTIAL_LAYOUT)).unwrap();
        assert!(matches!(asm.set_class_layout(Some(3), None), Err(Error::InvalidPacking(3))));
        asm.set_class_layout(Some(8), Some(16)).unwrap();
    }

    #[test]
    fn generic_param_selection() {
        use crate::assembler::GenericParamDecl;
        use crate::metadata::token::Token;

        let mut asm = assembler(AssemblerOptions::default());
        let header = ClassHeader::new("G", TypeAttributes::PUBLIC)
            .generic_param(GenericParamDecl::new("T").constraint(Token(0x01000005)));
        asm.start_class(header).unwrap();
        asm.select_type_param(VarRef::Name("T".to_string())).unwrap();
        asm.select_type_param_constraint(VarRef::Index(0), Token(0x01000005)).unwrap();
        assert!(matches!(
            asm.select_type_param(VarRef::Name("U".to_string())),
            Err(Error::UndefinedGenericParam(_))
        ));
        assert!(asm.select_type_param_constraint(VarRef::Index(0), Token(0x01000006)).is_err());
    }
}
