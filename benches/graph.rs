use criterion::{criterion_group, criterion_main, Criterion};
use fiber_pulse::{
    disable, enable, fiber_with, set_immediate, CancelSource, EventLoop, FiberOptions, Promise,
};

fn fiber_launch(c: &mut Criterion) {
    c.bench_function("fiber_launch_resolved", |b| {
        b.iter(|| {
            let rt = EventLoop::new();
            let handle = rt.scope(|| {
                enable();
                let handle = fiber_with(|| Promise::resolved(1), FiberOptions::default());
                disable();
                handle
            });
            rt.run();
            handle.result.try_result()
        });
    });
}

fn promise_chain(c: &mut Criterion) {
    c.bench_function("promise_chain_64", |b| {
        b.iter(|| {
            let rt = EventLoop::new();
            let tail = rt.scope(|| {
                enable();
                let (p, resolver) = Promise::<u64>::pending();
                let mut tail = p.then(|v| v);
                for _ in 0..63 {
                    tail = tail.then(|v| v + 1);
                }
                set_immediate(move || resolver.resolve(0));
                tail
            });
            rt.run();
            rt.scope(|| disable());
            tail.try_result()
        });
    });
}

fn abort_taint(c: &mut Criterion) {
    c.bench_function("abort_taint_256", |b| {
        b.iter(|| {
            let rt = EventLoop::new();
            let source = CancelSource::new();
            let handle = rt.scope(|| {
                enable();
                fiber_with(
                    || {
                        let (p, _keep) = Promise::<u64>::pending();
                        let mut chain = p.then(|v| v);
                        for _ in 0..255 {
                            chain = chain.then(|v| v);
                        }
                        chain
                    },
                    FiberOptions {
                        abort: Some(source.signal()),
                    },
                )
            });
            source.cancel("bench abort");
            rt.run();
            rt.scope(|| disable());
            handle.result.state()
        });
    });
}

criterion_group!(benches, fiber_launch, promise_chain, abort_taint);
criterion_main!(benches);
