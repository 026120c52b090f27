//! Benchmarks for assembling compilation units.
//!
//! Measures a full session from the first callback to [`Assembler::finish`]:
//! - Many small classes with forward calls between their methods
//! - Branch-heavy bodies under the shortening pass
//! - Identical bodies with code folding

extern crate dotasm;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use dotasm::{
    assembler::opcode,
    metadata::flags::{MethodAttributes, TypeAttributes},
    prelude::*,
};
use std::hint::black_box;

const VOID_STATIC: [u8; 3] = [0x00, 0x00, 0x01];

fn session(options: AssemblerOptions) -> Assembler<MemoryEmitter, MemorySections> {
    Assembler::new(MemoryEmitter::new(), MemorySections::new(), options)
}

fn static_method(name: &str) -> MethodHeader {
    MethodHeader::new(
        name,
        VOID_STATIC.to_vec(),
        MethodAttributes::PUBLIC | MethodAttributes::STATIC,
    )
}

/// Every method calls the next one, which is only declared afterwards.
fn forward_calls(classes: usize, methods: usize) -> EmittedImage {
    let mut asm = session(AssemblerOptions::default());
    for class in 0..classes {
        let name = format!("Bench.Class{class}");
        asm.start_class(ClassHeader::new(name.as_str(), TypeAttributes::PUBLIC))
            .unwrap();
        let token = asm.class_token(&name).unwrap();
        for method in 0..methods {
            asm.start_method(static_method(&format!("M{method}"))).unwrap();
            if method + 1 < methods {
                let next = asm
                    .member_ref(token, &format!("M{}", method + 1), VOID_STATIC.to_vec())
                    .unwrap();
                asm.emit_token(opcode::CALL, next).unwrap();
            }
            asm.emit_opcode(opcode::RET).unwrap();
            asm.end_method().unwrap();
        }
        asm.end_class().unwrap();
    }
    asm.finish().unwrap()
}

fn bench_forward_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_calls");
    for (classes, methods) in [(10, 10), (50, 20), (100, 50)] {
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{classes}x{methods}")),
            &(classes, methods),
            |b, &(classes, methods)| {
                b.iter(|| black_box(forward_calls(classes, methods)));
            },
        );
    }
    group.finish();
}

/// One method with a chain of forward branches, each a few bytes from its label.
fn bench_branch_shortening(c: &mut Criterion) {
    c.bench_function("branch_shortening_1000", |b| {
        b.iter(|| {
            let mut asm = session(AssemblerOptions::optimized());
            asm.start_method(static_method("Branches")).unwrap();
            for index in 0..1000 {
                let label = format!("L{index}");
                asm.emit_branch(opcode::BR, BranchTarget::Label(label.clone()))
                    .unwrap();
                asm.emit_opcode(opcode::NOP).unwrap();
                asm.emit_label(label).unwrap();
            }
            asm.emit_opcode(opcode::RET).unwrap();
            asm.end_method().unwrap();
            black_box(asm.finish().unwrap())
        });
    });
}

/// Many methods with the same body, all folded into the first.
fn bench_folding(c: &mut Criterion) {
    c.bench_function("fold_identical_bodies_500", |b| {
        b.iter(|| {
            let mut asm = session(AssemblerOptions::optimized());
            asm.start_class(ClassHeader::new("Bench.Folded", TypeAttributes::PUBLIC))
                .unwrap();
            for index in 0..500 {
                asm.start_method(static_method(&format!("M{index}"))).unwrap();
                asm.emit_string(opcode::LDSTR, "shared").unwrap();
                asm.emit_opcode(opcode::POP).unwrap();
                asm.emit_opcode(opcode::RET).unwrap();
                asm.end_method().unwrap();
            }
            asm.end_class().unwrap();
            black_box(asm.finish().unwrap())
        });
    });
}

criterion_group!(
    benches,
    bench_forward_calls,
    bench_branch_shortening,
    bench_folding
);
criterion_main!(benches);
