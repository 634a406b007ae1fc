use criterion::Criterion;
use libmqtt::network::application::mqtt::{ControlType, MessageQueue, MessageState};
use std::hint::black_box;

pub fn bench_register_and_clean(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");
    let mut buf = [0u8; 4096];
    group.bench_function("register_and_clean", |b| {
        b.iter(|| {
            let mut queue = MessageQueue::new(&mut buf);
            for id in 1..=32u16 {
                let free = queue.free_mut();
                free[..40].fill(id as u8);
                queue
                    .register(40, ControlType::Publish, id)
                    .expect("Queue full");
            }
            for index in (0..queue.len()).step_by(2) {
                queue.set_state(index, MessageState::Complete);
            }
            queue.clean();
            black_box(queue.len())
        })
    });
    group.finish();
}
