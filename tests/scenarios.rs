//! End-to-end compilation units driven through the public callback surface.
//!
//! Each test plays the role of the parser: it calls the assembler in source order and
//! checks what reached the in-memory metadata emitter.

use dotasm::{
    assembler::opcode,
    metadata::flags::{FieldAttributes, MethodAttributes, TypeAttributes},
    prelude::*,
    Result,
};

const VOID_STATIC: [u8; 3] = [0x00, 0x00, 0x01];
const INT32_FIELD: [u8; 2] = [0x06, 0x08];

fn session(options: AssemblerOptions) -> Assembler<MemoryEmitter, MemorySections> {
    // RUST_LOG=debug shows the emission phases
    let _ = env_logger::builder().is_test(true).try_init();
    Assembler::new(MemoryEmitter::new(), MemorySections::new(), options)
}

fn main_header(name: &str) -> MethodHeader {
    MethodHeader::new(
        name,
        VOID_STATIC.to_vec(),
        MethodAttributes::PUBLIC | MethodAttributes::STATIC,
    )
}

/// A single static `void Main()` containing only `ret`, marked as the entry point.
#[test]
fn tiny_entry_point() -> Result<()> {
    let mut asm = session(AssemblerOptions::default());
    asm.start_class(ClassHeader::new("Program", TypeAttributes::PUBLIC))?;
    asm.start_method(main_header("Main"))?;
    asm.emit_entry_point()?;
    asm.emit_opcode(opcode::RET)?;
    asm.end_method()?;
    asm.end_class()?;

    let image = asm.finish()?;
    assert_eq!(image.methods.len(), 1);

    let main = &image.methods[0];
    // Tiny header: code size 1 in the upper six bits, format 0b10
    assert_eq!(main.body, vec![(1 << 2) | 0x2, 0x2A]);
    assert_eq!(image.entry_point, Some(main.token));
    assert_eq!(asm.emitter().method(main.token).map(|m| m.name.as_str()), Some("Main"));
    Ok(())
}

/// A second `.entrypoint` in the same unit is rejected, even in the same method.
#[test]
fn second_entry_point_rejected() -> Result<()> {
    let mut asm = session(AssemblerOptions::default());
    asm.start_class(ClassHeader::new("Program", TypeAttributes::PUBLIC))?;

    asm.start_method(main_header("Main"))?;
    asm.emit_entry_point()?;
    let err = asm.emit_entry_point().unwrap_err();
    assert!(matches!(err, Error::Duplicate { kind: "entry point", .. }));
    asm.emit_opcode(opcode::RET)?;
    asm.end_method()?;

    asm.start_method(main_header("OtherMain"))?;
    let err = asm.emit_entry_point().unwrap_err();
    assert!(matches!(err, Error::Duplicate { kind: "entry point", .. }));
    Ok(())
}

/// A forward reference to a class that is never declared fails class emission after every
/// other class was defined, naming the missing class.
#[test]
fn undefined_class_fails_class_emission() -> Result<()> {
    let mut asm = session(AssemblerOptions {
        auto_inherit_from_object: false,
        ..AssemblerOptions::default()
    });
    let helper = asm.class_token("Util.Helper")?;

    asm.start_class(ClassHeader::new("First", TypeAttributes::PUBLIC).extends(helper))?;
    asm.end_class()?;
    asm.start_class(ClassHeader::new("Second", TypeAttributes::PUBLIC))?;
    asm.end_class()?;

    let err = asm.finish().unwrap_err();
    assert!(matches!(err, Error::PhaseFailed { phase: "class emission", .. }));

    let emitter = asm.emitter();
    assert!(emitter.type_token("First").is_some());
    assert!(emitter.type_token("Second").is_some());
    assert!(emitter.methods.is_empty());

    let diagnostics = asm.diagnostics();
    assert_eq!(diagnostics.error_count(), 1);
    assert!(diagnostics.mentions("Util.Helper"));
    Ok(())
}

/// `.field static int32 x` at module scope lands on `<Module>`.
#[test]
fn global_static_field() -> Result<()> {
    let mut asm = session(AssemblerOptions::default());
    asm.add_field(FieldDecl::new("x", INT32_FIELD.to_vec(), FieldAttributes::STATIC))?;
    asm.finish()?;

    let module = asm.emitter().type_token("<Module>").expect("module type");
    let (_, field) = asm.emitter().field(module, "x").expect("global field");
    assert_ne!(field.flags & FieldAttributes::STATIC, 0);
    assert!(!asm.diagnostics().has_any());
    Ok(())
}

/// A non-static global field is made static with a warning.
#[test]
fn global_instance_field_corrected() -> Result<()> {
    let mut asm = session(AssemblerOptions::default());
    asm.add_field(FieldDecl::new("y", INT32_FIELD.to_vec(), FieldAttributes::PUBLIC))?;
    asm.finish()?;

    let module = asm.emitter().type_token("<Module>").expect("module type");
    let (_, field) = asm.emitter().field(module, "y").expect("global field");
    assert_ne!(field.flags & FieldAttributes::STATIC, 0);
    assert_eq!(asm.diagnostics().warning_count(), 1);
    assert!(asm.diagnostics().mentions("made static"));
    Ok(())
}

/// Strict sessions reject the non-static global field instead.
#[test]
fn global_instance_field_strict() {
    let mut asm = session(AssemblerOptions::strict());
    let err = asm
        .add_field(FieldDecl::new("y", INT32_FIELD.to_vec(), FieldAttributes::PUBLIC))
        .unwrap_err();
    assert!(matches!(err, Error::Policy(_)));
}

/// Tolerant sessions record every error and fail the unit once at the end.
#[test]
fn tolerant_session_collects_errors() -> Result<()> {
    let mut asm = session(AssemblerOptions::tolerant());
    asm.end_class()?;
    asm.start_class(ClassHeader::new("A", TypeAttributes::PUBLIC))?;
    asm.start_method(main_header("Run"))?;
    asm.emit_branch(opcode::BR, BranchTarget::from("nowhere"))?;
    asm.end_method()?;
    asm.end_class()?;

    let err = asm.finish().unwrap_err();
    assert!(matches!(err, Error::CompilationFailed(2)));
    assert!(asm.diagnostics().mentions("nowhere"));
    Ok(())
}

/// Nested classes are defined after their encloser and carry its token.
#[test]
fn nested_classes() -> Result<()> {
    let mut asm = session(AssemblerOptions {
        auto_inherit_from_object: false,
        ..AssemblerOptions::default()
    });
    asm.start_namespace("Outer.Space");
    asm.start_class(ClassHeader::new("Ship", TypeAttributes::PUBLIC))?;
    asm.start_class(ClassHeader::new("Engine", TypeAttributes::NESTED_PUBLIC))?;
    asm.end_class()?;
    asm.end_class()?;
    asm.end_namespace()?;

    let image = asm.finish()?;
    let names: Vec<&str> = image.classes.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["<Module>", "Outer.Space.Ship", "Outer.Space.Ship/Engine"]);

    let emitter = asm.emitter();
    let ship = emitter.type_token("Outer.Space.Ship").expect("ship");
    let (_, engine) = &emitter.types[2];
    assert_eq!(engine.name, "Engine");
    assert!(engine.namespace.is_empty());
    assert_eq!(engine.encloser, Some(ship));
    Ok(())
}
