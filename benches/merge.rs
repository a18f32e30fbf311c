//! Criterion benchmarks for gitprune performance testing.
//!
//! These benchmarks invoke the release binary as a subprocess, so they cover
//! process startup, file I/O and the complete merge pipeline. Inputs are
//! generated into a temp dir on each run.

use criterion::{Criterion, criterion_group, criterion_main};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

const BINARY: &str = "./target/release/gitprune";

/// Template with `sections` headed sections of 20 entries each
fn generate_template(sections: usize) -> String {
    let mut out = String::new();
    for s in 0..sections {
        out.push_str(&format!("# Section {} logs build cache\n", s));
        for e in 0..20 {
            out.push_str(&format!("section{}/entry{}.log\n", s, e));
        }
        out.push('\n');
    }
    out
}

/// Project file where every other entry already exists in the template
fn generate_project(sections: usize) -> String {
    let mut out = String::from("# Project entries\n");
    for s in 0..sections {
        for e in 0..20 {
            if e % 2 == 0 {
                out.push_str(&format!("section{}/entry{}.log\n", s, e));
            } else {
                out.push_str(&format!("local{}/build{}/\n", s, e));
            }
        }
    }
    out
}

fn write_inputs(dir: &Path, sections: usize) -> (PathBuf, PathBuf) {
    let template = dir.join("template.gitignore");
    let project = dir.join("project.gitignore");
    fs::write(&template, generate_template(sections)).expect("Failed to write template");
    fs::write(&project, generate_project(sections)).expect("Failed to write project");
    (template, project)
}

fn bench_with_args(c: &mut Criterion, name: &str, sections: usize, extra: &[&str]) {
    if !Path::new(BINARY).exists() {
        eprintln!("Skipping {}: {} not found", name, BINARY);
        return;
    }

    let temp = TempDir::new().expect("Failed to create temp dir");
    let (template, project) = write_inputs(temp.path(), sections);

    c.bench_function(name, |b| {
        b.iter(|| {
            Command::new(BINARY)
                .arg("--no-config")
                .args(extra)
                .arg(&template)
                .arg(&project)
                .output()
                .expect("Failed to execute gitprune")
        })
    });
}

/// Benchmark a typical template-sized merge
fn bench_small_merge(c: &mut Criterion) {
    bench_with_args(c, "small_merge", 5, &[]);
}

/// Benchmark a large merge with the default policies
fn bench_large_merge(c: &mut Criterion) {
    bench_with_args(c, "large_merge", 500, &[]);
}

/// Benchmark loose matching with section placement (heading scan per entry)
fn bench_large_section_placement(c: &mut Criterion) {
    bench_with_args(
        c,
        "large_section_placement",
        500,
        &["--policy", "loose", "--placement", "section"],
    );
}

criterion_group!(
    benches,
    bench_small_merge,
    bench_large_merge,
    bench_large_section_placement
);
criterion_main!(benches);
