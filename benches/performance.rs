use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use open_kernel::{
    AuthorRole, ChatHistory, ChatMessageContent, FunctionCallContent, FunctionFilters, Kernel,
    StreamingAggregator, StreamingChatMessageContent, function,
};
use serde_json::json;

// Deltas for one streamed answer: a role chunk, text pieces, and one tool call
// whose arguments arrive in `fragments` pieces
fn create_deltas(text_pieces: usize, fragments: usize) -> Vec<StreamingChatMessageContent> {
    let mut deltas = vec![StreamingChatMessageContent::empty(0).with_role(AuthorRole::Assistant)];
    deltas.extend((0..text_pieces).map(|_| StreamingChatMessageContent::text(0, "token ")));

    let mut head = FunctionCallContent::fragment("{\"values\": [").with_index(0);
    head.id = Some("call_0".to_string());
    head.name = Some("math-Sum".to_string());
    deltas.push(StreamingChatMessageContent::empty(0).with_tool_call(head));
    for i in 0..fragments {
        let piece = FunctionCallContent::fragment(format!("{}, ", i)).with_index(0);
        deltas.push(StreamingChatMessageContent::empty(0).with_tool_call(piece));
    }
    deltas
}

fn create_kernel(plugins: usize, per_plugin: usize) -> Kernel {
    let mut kernel = Kernel::new();
    for p in 0..plugins {
        for f in 0..per_plugin {
            let function = function(format!("plugin{}", p), format!("Function{}", f))
                .param("input", "string", "Input text")
                .build(|_| async { Ok(json!(null)) })
                .unwrap();
            kernel.register(function).unwrap();
        }
    }
    kernel
}

// Benchmark: pairwise combine over a full stream
fn bench_combine(c: &mut Criterion) {
    let mut group = c.benchmark_group("combine_deltas");

    for count in [10, 100, 1000].iter() {
        let deltas = create_deltas(*count, *count / 10);
        group.bench_with_input(BenchmarkId::from_parameter(count), &deltas, |b, deltas| {
            b.iter(|| {
                let mut iter = deltas.iter().cloned();
                let first = iter.next().unwrap();
                let combined = iter.fold(first, |acc, next| acc.combine(next).unwrap());
                black_box(combined)
            });
        });
    }

    group.finish();
}

// Benchmark: aggregator across several choices
fn bench_aggregator(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregator_choices");

    for choices in [1u32, 4, 16].iter() {
        let deltas = create_deltas(200, 20);
        group.bench_with_input(BenchmarkId::from_parameter(choices), choices, |b, &choices| {
            b.iter(|| {
                let mut aggregator = StreamingAggregator::new();
                for delta in &deltas {
                    let batch = (0..choices)
                        .map(|i| StreamingChatMessageContent {
                            choice_index: i,
                            ..delta.clone()
                        })
                        .collect();
                    aggregator.push_batch(batch).unwrap();
                }
                black_box(aggregator.finish())
            });
        });
    }

    group.finish();
}

// Benchmark: filtering the registry for a tool offer
fn bench_list_for_choice(c: &mut Criterion) {
    let mut group = c.benchmark_group("list_for_choice");
    let kernel = create_kernel(20, 10);

    group.bench_function("all", |b| {
        let filters = FunctionFilters::default();
        b.iter(|| black_box(kernel.list_for_choice(&filters)))
    });

    group.bench_function("include_plugin_exclude_function", |b| {
        let filters = FunctionFilters::default()
            .include_plugin("plugin3")
            .exclude_function("plugin3-Function7");
        b.iter(|| black_box(kernel.list_for_choice(&filters)))
    });

    group.finish();
}

// Benchmark: history serialization
fn bench_history_serialize(c: &mut Criterion) {
    let mut history = ChatHistory::with_system_message("You are a helpful assistant");
    for i in 0..100 {
        history.add_user_message(format!("question {}", i));
        history.add_message(ChatMessageContent::assistant(format!("answer {}", i)));
    }

    c.bench_function("history_serialize_200", |b| {
        b.iter(|| black_box(serde_json::to_string(&history).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_combine,
    bench_aggregator,
    bench_list_for_choice,
    bench_history_serialize
);
criterion_main!(benches);
