//! Benchmarks for escape analysis and the transforms it drives

use compiler::ir::escape::{EscapeAnalysisPass, EscapeOptions, SummaryCache};
use compiler::ir::optimization::OptimizationPass;
use compiler::ir::{BinaryOp, IrBuilder, IrModule, IrType, MethodFlags};
use compiler::samples::Scenario;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;

/// One method allocating `objects` instances of a class with `fields` int
/// fields, filling every field and summing them back. Every third object is
/// handed to a callee that only reads it.
fn generate_wide_method(objects: usize, fields: usize) -> Option<IrModule> {
    let mut b = IrBuilder::new("wide");
    let class = b.registry_mut().add_class("Wide");
    let slots: Vec<_> = (0..fields)
        .map(|i| {
            b.registry_mut()
                .add_field(class, &format!("f{}", i), IrType::I32, i % 4 == 0)
        })
        .collect();
    let read = b.registry_mut().add_method(
        class,
        "read",
        vec![IrType::Object(class)],
        IrType::I32,
        MethodFlags::static_method(),
    );
    let entry = b.registry_mut().add_method(
        class,
        "fill",
        vec![],
        IrType::I32,
        MethodFlags::static_method(),
    );

    b.start_function(read)?;
    let this = b.param(0)?;
    let first = b.build_get_field(this, *slots.first()?)?;
    b.build_return(Some(first))?;
    b.finish_function();

    b.start_function(entry)?;
    let mut total = b.build_i32(0)?;
    for i in 0..objects {
        let obj = b.build_new_obj(class)?;
        for (n, field) in slots.iter().enumerate() {
            let value = b.build_i32(n as i32)?;
            b.build_put_field(obj, *field, value)?;
        }
        if i % 3 == 0 {
            let r = b.build_call(read, vec![obj])??;
            total = b.build_binop(BinaryOp::Add, total, r)?;
        }
        for field in &slots {
            let v = b.build_get_field(obj, *field)?;
            total = b.build_binop(BinaryOp::Add, total, v)?;
        }
    }
    b.build_return(Some(total))?;
    b.finish_function();
    Some(b.finish())
}

fn run_escape(module: &mut IrModule, options: &EscapeOptions) -> usize {
    let mut pass = EscapeAnalysisPass::with_cache(options.clone(), Arc::new(SummaryCache::new()));
    pass.run_on_module(module).instructions_eliminated
}

fn benchmark_samples(c: &mut Criterion) {
    let mut group = c.benchmark_group("samples");
    let options = EscapeOptions::default();

    for scenario in Scenario::ALL {
        let Some(sample) = scenario.build() else {
            continue;
        };
        group.bench_with_input(
            BenchmarkId::from_parameter(scenario),
            &sample.module,
            |b, module| {
                b.iter(|| {
                    let mut module = module.clone();
                    black_box(run_escape(&mut module, &options))
                });
            },
        );
    }
    group.finish();
}

fn benchmark_object_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("object_count");
    let options = EscapeOptions::default();

    for objects in [4, 16, 64, 256].iter() {
        let Some(module) = generate_wide_method(*objects, 4) else {
            continue;
        };
        group.bench_with_input(BenchmarkId::from_parameter(objects), &module, |b, module| {
            b.iter(|| {
                let mut module = module.clone();
                black_box(run_escape(&mut module, &options))
            });
        });
    }
    group.finish();
}

fn benchmark_field_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("field_count");
    let options = EscapeOptions::default();

    for fields in [2, 8, 32, 128].iter() {
        let Some(module) = generate_wide_method(8, *fields) else {
            continue;
        };
        group.bench_with_input(BenchmarkId::from_parameter(fields), &module, |b, module| {
            b.iter(|| {
                let mut module = module.clone();
                black_box(run_escape(&mut module, &options))
            });
        });
    }
    group.finish();
}

fn benchmark_analysis_only(c: &mut Criterion) {
    let options = EscapeOptions::analysis_only();
    let Some(module) = generate_wide_method(64, 8) else {
        return;
    };

    c.bench_function("analysis_only_64x8", |b| {
        b.iter(|| {
            let mut module = module.clone();
            black_box(run_escape(&mut module, &options))
        });
    });
}

criterion_group!(
    benches,
    benchmark_samples,
    benchmark_object_count,
    benchmark_field_count,
    benchmark_analysis_only
);
criterion_main!(benches);
