//! Manifest directives: assembly identity, references, files, exported types and
//! embedded resources.

use std::io::Write;

use dotasm::{
    manifest::compute_hash,
    metadata::flags::{
        AssemblyFlags, AssemblyHashAlgorithm, FileAttributes, ManifestResourceAttributes,
        TypeAttributes,
    },
    prelude::*,
    Result,
};

fn session() -> Assembler<MemoryEmitter, MemorySections> {
    Assembler::new(MemoryEmitter::new(), MemorySections::new(), AssemblerOptions::default())
}

fn temp_file(contents: &[u8]) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents).unwrap();
    file.flush().unwrap();
    file
}

const KEY: [u8; 12] = [0x00, 0x24, 0x00, 0x00, 0x04, 0x80, 0x00, 0x00, 0x94, 0x00, 0x00, 0x00];

/// The assembly keeps its full key; references store the token of theirs.
#[test]
fn identity_and_reference() -> Result<()> {
    let mut asm = session();
    asm.declare_assembly(
        AssemblyDecl::new("Widgets")
            .version([2, 1, 0, 0])
            .originator(Originator::PublicKey(KEY.to_vec())),
    )?;
    let reference = asm.declare_assembly_ref(
        AssemblyDecl::new("Toolkit")
            .alias("tk")
            .version([1, 0, 0, 0])
            .originator(Originator::PublicKey(KEY.to_vec())),
    )?;
    // Defined at once so that type references can use it as scope
    assert_eq!(asm.emitter().assembly_refs[0].0, reference);

    asm.finish()?;
    let emitter = asm.emitter();
    let assembly = emitter.assembly.as_ref().expect("assembly row");
    assert_eq!(assembly.name, "Widgets");
    assert_eq!(assembly.version, [2, 1, 0, 0]);
    assert_eq!(assembly.public_key, KEY);
    assert_ne!(assembly.flags & AssemblyFlags::PUBLIC_KEY, 0);

    let (_, toolkit) = &emitter.assembly_refs[0];
    assert_eq!(toolkit.name, "Toolkit");
    assert_eq!(
        toolkit.public_key,
        Originator::PublicKey(KEY.to_vec()).to_token(AssemblyHashAlgorithm::SHA1)?
    );
    assert_eq!(toolkit.flags & AssemblyFlags::PUBLIC_KEY, 0);
    Ok(())
}

/// Aliases name references; a second reference with the same alias is rejected.
#[test]
fn duplicate_reference_alias() -> Result<()> {
    let mut asm = session();
    asm.declare_assembly_ref(AssemblyDecl::new("System.Runtime").alias("rt"))?;
    let err = asm
        .declare_assembly_ref(AssemblyDecl::new("System.Private.CoreLib").alias("rt"))
        .unwrap_err();
    assert!(matches!(err, Error::Duplicate { kind: "assembly reference", .. }));
    assert_eq!(asm.emitter().assembly_refs.len(), 1);
    Ok(())
}

/// A file declared with a path but no hash is hashed with the assembly's algorithm.
#[test]
fn file_hash_computed() -> Result<()> {
    let contents = b"resource file contents";
    let file = temp_file(contents);

    let mut asm = session();
    asm.declare_assembly(
        AssemblyDecl::new("Widgets").hash_algorithm(AssemblyHashAlgorithm::MD5),
    )?;
    asm.declare_file(FileDecl::new("data.bin").path(file.path()).no_metadata())?;
    asm.declare_file(FileDecl::new("given.bin").hash(vec![0xAB; 20]))?;
    asm.finish()?;

    let files = &asm.emitter().files;
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].1.name, "data.bin");
    assert_eq!(files[0].1.hash, compute_hash(contents, AssemblyHashAlgorithm::MD5));
    assert_eq!(files[0].1.hash.len(), 16);
    assert_eq!(files[0].1.flags, FileAttributes::CONTAINS_NO_META_DATA);
    assert_eq!(files[1].1.hash, vec![0xAB; 20]);
    Ok(())
}

/// Exported types point at their file, their forwarding target or their encloser.
#[test]
fn exported_types() -> Result<()> {
    let mut asm = session();
    asm.declare_assembly(AssemblyDecl::new("Widgets"))?;
    let toolkit = asm.declare_assembly_ref(AssemblyDecl::new("Toolkit"))?;
    asm.declare_file(FileDecl::new("module2.netmodule"))?;

    asm.declare_com_type(ComTypeDecl::new(
        "Lib.Widget",
        TypeAttributes::PUBLIC,
        ComTypeImpl::File("module2.netmodule".to_string()),
    ))?;
    asm.declare_com_type(ComTypeDecl::new(
        "Part",
        TypeAttributes::NESTED_PUBLIC,
        ComTypeImpl::Nested("Lib.Widget".to_string()),
    ))?;
    asm.declare_com_type(ComTypeDecl::new(
        "Lib.Moved",
        TypeAttributes::PUBLIC,
        ComTypeImpl::AssemblyRef("Toolkit".to_string()),
    ))?;
    asm.finish()?;

    let emitter = asm.emitter();
    let file = emitter.files[0].0;
    let exported = &emitter.exported_types;
    assert_eq!(exported.len(), 3);

    let (widget_token, widget) = &exported[0];
    assert_eq!((widget.namespace.as_str(), widget.name.as_str()), ("Lib", "Widget"));
    assert_eq!(widget.implementation, file);
    assert_eq!(exported[1].1.implementation, *widget_token);
    assert_eq!(exported[2].1.implementation, toolkit);
    Ok(())
}

/// Embedded resources are read when the unit is finished and laid out with 8 byte
/// alignment, each behind its length.
#[test]
fn embedded_resources() -> Result<()> {
    let strings = temp_file(b"hello");
    let icons = temp_file(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00]);

    let mut asm = session();
    asm.declare_assembly(AssemblyDecl::new("Widgets"))?;
    asm.declare_resource(ResourceDecl::new(
        "Widgets.Strings.resources",
        ManifestResourceAttributes::PUBLIC,
        ResourceSource::Embedded(strings.path().to_path_buf()),
    ))?;
    asm.declare_resource(ResourceDecl::new(
        "Widgets.Icon.png",
        ManifestResourceAttributes::PRIVATE,
        ResourceSource::Embedded(icons.path().to_path_buf()),
    ))?;

    let image = asm.finish()?;
    let names: Vec<&str> = image.resources.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, ["Widgets.Strings.resources", "Widgets.Icon.png"]);
    assert_eq!((image.resources[0].offset, image.resources[0].size), (0, 5));
    assert_eq!((image.resources[1].offset, image.resources[1].size), (16, 9));

    let blob = &image.resource_blob;
    assert_eq!(blob.len(), 32);
    assert_eq!(&blob[..4], &5u32.to_le_bytes());
    assert_eq!(&blob[4..9], b"hello");
    assert_eq!(&blob[16..20], &9u32.to_le_bytes());
    assert_eq!(blob[20], 0x89);

    let rows = &asm.emitter().resources;
    assert!(rows[0].1.implementation.is_null());
    assert_eq!(rows[1].1.offset, 16);
    assert_eq!(rows[1].1.flags, ManifestResourceAttributes::PRIVATE);
    Ok(())
}

/// Each pass lays out the resources it emits in its own blob.
#[test]
fn embedded_resources_across_passes() -> Result<()> {
    let first = temp_file(b"first pass");
    let second = temp_file(b"second");

    let mut asm = session();
    asm.declare_assembly(AssemblyDecl::new("Widgets"))?;
    asm.declare_resource(ResourceDecl::new(
        "Widgets.First",
        ManifestResourceAttributes::PUBLIC,
        ResourceSource::Embedded(first.path().to_path_buf()),
    ))?;
    let image = asm.finish()?;
    assert_eq!((image.resources[0].offset, image.resources[0].size), (0, 10));
    assert_eq!(image.resource_blob.len(), 16);

    asm.declare_resource(ResourceDecl::new(
        "Widgets.Second",
        ManifestResourceAttributes::PUBLIC,
        ResourceSource::Embedded(second.path().to_path_buf()),
    ))?;
    let image = asm.finish()?;
    assert_eq!(image.resources.len(), 1);
    assert_eq!(image.resources[0].name, "Widgets.Second");
    assert_eq!((image.resources[0].offset, image.resources[0].size), (0, 6));
    assert_eq!(&image.resource_blob[4..10], b"second");

    let rows = &asm.emitter().resources;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].1.offset, 0);
    Ok(())
}

/// A resource stored in a file that was never declared fails the manifest phase.
#[test]
fn resource_in_undeclared_file() -> Result<()> {
    let mut asm = session();
    asm.declare_assembly(AssemblyDecl::new("Widgets"))?;
    asm.declare_resource(ResourceDecl::new(
        "Widgets.Data",
        ManifestResourceAttributes::PUBLIC,
        ResourceSource::File {
            name: "missing.bin".to_string(),
            offset: 0,
        },
    ))?;

    let err = asm.finish().unwrap_err();
    assert!(matches!(err, Error::PhaseFailed { phase: "manifest emission", .. }));
    assert!(asm.diagnostics().mentions("missing.bin"));
    Ok(())
}
