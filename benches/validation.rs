//! SQL Validation Performance Benchmarks
//!
//! Benchmarks for the statement validator. These benchmarks measure the
//! performance of:
//! - Clean single-statement validation
//! - Comment- and literal-heavy statements
//! - Denylist rejection
//! - Procedure-definition validation

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tutela::config::SafetyConfig;
use tutela::validator::{validate, validate_procedure_definition, ValidationContext};

fn bench_validate_clean_select(c: &mut Criterion) {
    let config = SafetyConfig::default();
    let ctx = ValidationContext { has_active_transaction: true, config: &config };

    c.bench_function("validate_clean_select", |b| {
        b.iter(|| {
            validate(
                black_box("SELECT Id, Total FROM Orders WHERE CustomerId = @CustomerId"),
                ctx,
            )
        });
    });
}

fn bench_validate_comment_heavy(c: &mut Criterion) {
    let config = SafetyConfig::default();
    let ctx = ValidationContext { has_active_transaction: true, config: &config };

    let sql = "-- fetch orders\n\
               SELECT * /* all columns */ FROM Orders -- main table\n\
               WHERE note = 'it''s /* not a comment */ fine' /* tail */";

    c.bench_function("validate_comment_heavy", |b| {
        b.iter(|| validate(black_box(sql), ctx));
    });
}

fn bench_validate_denylist_hit(c: &mut Criterion) {
    let config = SafetyConfig::default();
    let ctx = ValidationContext { has_active_transaction: true, config: &config };

    c.bench_function("validate_denylist_hit", |b| {
        b.iter(|| validate(black_box("DROP TABLE Orders"), ctx));
    });
}

fn bench_validate_large_statement(c: &mut Criterion) {
    let config = SafetyConfig::default();
    let ctx = ValidationContext { has_active_transaction: true, config: &config };

    // A wide IN-list, the common shape of generated statements
    let ids: Vec<String> = (0..500).map(|i| i.to_string()).collect();
    let sql = format!("UPDATE Orders SET Flagged = 1 WHERE Id IN ({})", ids.join(", "));

    c.bench_function("validate_large_statement", |b| {
        b.iter(|| validate(black_box(&sql), ctx));
    });
}

fn bench_validate_procedure_definition(c: &mut Criterion) {
    let config = SafetyConfig::default();

    let definition = "CREATE OR ALTER PROCEDURE GetCustomerOrders @CustomerId INT AS \
                      SELECT * FROM Orders WHERE CustomerId = @CustomerId";

    c.bench_function("validate_procedure_definition", |b| {
        b.iter(|| validate_procedure_definition(black_box(definition), &config));
    });
}

criterion_group!(
    benches,
    bench_validate_clean_select,
    bench_validate_comment_heavy,
    bench_validate_denylist_hit,
    bench_validate_large_statement,
    bench_validate_procedure_definition
);
criterion_main!(benches);
