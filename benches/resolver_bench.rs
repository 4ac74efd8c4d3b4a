//! Quick benchmark for config resolution and condition evaluation

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};

use reweave::condition::ConditionEvaluator;
use reweave::ir::Condition;
use reweave::template::resolve;

fn main() {
    let mut outputs: HashMap<String, Arc<Value>> = HashMap::new();
    outputs.insert(
        "fetch".to_string(),
        Arc::new(json!({"status": 200, "body": {"items": [{"id": 7}, {"id": 9}]}})),
    );
    outputs.insert("score".to_string(), Arc::new(json!({"value": 91.5})));

    let configs = vec![
        json!({"url": "https://example.com", "retries": 3}),
        json!({"target": "$nodes.fetch.body.items[0].id"}),
        json!({"summary": "status $nodes.fetch.status with ${ $nodes.score.value } points"}),
        json!({"all": "$nodes.fetch", "nested": {"deep": ["$nodes.score.value"]}}),
    ];

    println!("Config Resolution Performance");
    println!("=============================\n");

    for config in &configs {
        let iterations = 100_000u32;
        let start = Instant::now();
        for _ in 0..iterations {
            let _ = resolve(config, &outputs);
        }
        let elapsed = start.elapsed();
        println!("Config: {config}");
        println!("  {} iterations: {:?}", iterations, elapsed);
        println!("  per op: {:?}\n", elapsed / iterations);
    }

    println!("Condition Evaluation Performance (compiled-expression cache)");
    println!("============================================================\n");

    let evaluator = ConditionEvaluator::new();
    let conditions = vec![
        Condition::cel("output.score > 80"),
        Condition::cel("output.status != 'success' && output.attempts < 5"),
        Condition::cel("$.body.items[0].id == 7 || ctx.score.value >= 90"),
    ];
    let output = json!({
        "score": 91, "status": "pending", "attempts": 2,
        "body": {"items": [{"id": 7}]}
    });
    let ctx = json!({"score": {"value": 91.5}});

    for condition in &conditions {
        let iterations = 100_000u32;
        let start = Instant::now();
        for _ in 0..iterations {
            let _ = evaluator.evaluate(condition, &output, &ctx);
        }
        let elapsed = start.elapsed();
        println!("Expression: {}", condition.expression);
        println!("  {} iterations: {:?}", iterations, elapsed);
        println!("  per op: {:?}\n", elapsed / iterations);
    }

    println!(
        "cache holds {} compiled expressions",
        evaluator.cached_expressions()
    );
}
