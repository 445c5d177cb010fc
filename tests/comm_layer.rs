use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use kmerbus::{CommBuilder, CommLayer, Error, LocalFabric, LocalTransport, Transport};
use serial_test::serial;

/// Run one closure per rank, each rank on its own thread over a shared
/// in-process fabric.
fn run_ranks<C, B>(ranks: usize, configure: C, body: B)
where
    C: Fn(CommBuilder<LocalTransport>) -> CommBuilder<LocalTransport> + Send + Sync + 'static,
    B: Fn(CommLayer<LocalTransport>) + Send + Sync + 'static,
{
    let configure = Arc::new(configure);
    let body = Arc::new(body);
    let mut handles = vec![];
    for transport in LocalFabric::create(ranks) {
        let configure = Arc::clone(&configure);
        let body = Arc::clone(&body);
        handles.push(thread::spawn(move || {
            let layer = configure(CommBuilder::new(transport)).build().unwrap();
            body(layer);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

/// Tiny buffers and a short outbound queue, so packing and backpressure are
/// exercised even by small scenarios.
fn small_buffers(b: CommBuilder<LocalTransport>) -> CommBuilder<LocalTransport> {
    b.with_buffer_capacity(16).with_send_queue_depth(4)
}

#[test]
fn echo_single_tag() {
    run_ranks(2, small_buffers, |layer| {
        let rank = layer.comm_rank();
        let peer = 1 - rank;

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        layer
            .add_receive_callback(1, move |data, src| {
                if !data.is_empty() {
                    sink.lock().unwrap().push((data.to_vec(), src));
                }
            })
            .unwrap();

        layer.init_communication();
        layer.send_message(&[rank as u8, 0, 0, 0], peer, 1).unwrap();
        layer.flush(1).unwrap();
        layer.finish(1);
        layer.finish_communication();

        let received = received.lock().unwrap();
        assert_eq!(received.as_slice(), &[(vec![peer as u8, 0, 0, 0], peer)]);
    });
}

#[test]
fn buffered_packing_preserves_order() {
    run_ranks(2, small_buffers, |layer| {
        let rank = layer.comm_rank();

        let chunks = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&chunks);
        layer
            .add_receive_callback(1, move |data, _src| {
                if !data.is_empty() {
                    sink.lock().unwrap().push(data.to_vec());
                }
            })
            .unwrap();

        layer.init_communication();
        if rank == 0 {
            for i in 1..=5u8 {
                layer.send_message(&[i, 0, 0, 0], 1, 1).unwrap();
            }
        }
        layer.flush(1).unwrap();
        layer.finish(1);
        layer.finish_communication();

        let chunks = chunks.lock().unwrap();
        if rank == 1 {
            // Four 4-byte records fill one 16-byte buffer; the fifth rides in
            // the partial buffer that the flush harvests.
            let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
            assert_eq!(sizes, vec![16, 4]);

            let bytes: Vec<u8> = chunks.concat();
            let values: Vec<u8> = bytes.chunks_exact(4).map(|r| r[0]).collect();
            assert_eq!(values, vec![1, 2, 3, 4, 5]);
        } else {
            assert!(chunks.is_empty());
        }
    });
}

#[test]
fn self_loopback_bypasses_the_fabric() {
    run_ranks(2, small_buffers, |layer| {
        let rank = layer.comm_rank();

        let received = Arc::new(Mutex::new(Vec::new()));
        let end_markers = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&received);
        let markers = Arc::clone(&end_markers);
        layer
            .add_receive_callback(7, move |data, src| {
                if data.is_empty() {
                    markers.fetch_add(1, Ordering::SeqCst);
                } else {
                    sink.lock().unwrap().push((data.to_vec(), src));
                }
            })
            .unwrap();

        layer.init_communication();
        if rank == 0 {
            layer.send_message(&[42], 0, 7).unwrap();
        }
        layer.flush(7).unwrap();
        layer.finish(7);
        layer.finish_communication();

        let received = received.lock().unwrap();
        if rank == 0 {
            assert_eq!(received.as_slice(), &[(vec![42u8], 0)]);
        } else {
            assert!(received.is_empty());
        }
        // The end-of-stream cascade fires exactly once per tag.
        assert_eq!(end_markers.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn multi_tag_isolation() {
    run_ranks(2, small_buffers, |layer| {
        let rank = layer.comm_rank();
        let peer = 1 - rank;

        let tag1_bytes = Arc::new(AtomicUsize::new(0));
        let tag2_bytes = Arc::new(AtomicUsize::new(0));
        for (tag, counter) in [(1, &tag1_bytes), (2, &tag2_bytes)] {
            let counter = Arc::clone(counter);
            layer
                .add_receive_callback(tag, move |data, _src| {
                    counter.fetch_add(data.len(), Ordering::SeqCst);
                })
                .unwrap();
        }

        layer.init_communication();
        for i in 0..100u8 {
            layer.send_message(&[1, i, 0, 0], peer, 1).unwrap();
            layer.send_message(&[2, i, 0, 0], peer, 2).unwrap();
        }
        layer.flush(1).unwrap();

        // Tag 1 is closed; tag 2 keeps flowing.
        assert!(matches!(
            layer.send_message(&[0; 4], peer, 1),
            Err(Error::TagClosed(1))
        ));
        for i in 0..50u8 {
            layer.send_message(&[2, i, 0, 1], peer, 2).unwrap();
        }

        layer.finish(1);
        layer.flush(2).unwrap();
        layer.finish(2);
        layer.finish_communication();

        // Callback threads are joined now; both streams arrived in full,
        // tag 2 unaffected by tag 1's earlier termination.
        assert_eq!(tag1_bytes.load(Ordering::SeqCst), 400);
        assert_eq!(tag2_bytes.load(Ordering::SeqCst), 600);
    });
}

#[test]
#[serial]
fn backpressure_drops_nothing() {
    run_ranks(2, small_buffers, |layer| {
        let rank = layer.comm_rank();

        let payloads = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&payloads);
        layer
            .add_receive_callback(1, move |data, _src| {
                assert_eq!(data.len() % 4, 0);
                sink.fetch_add(data.len() / 4, Ordering::SeqCst);
            })
            .unwrap();

        layer.init_communication();
        if rank == 0 {
            // Eight producers against a 4-deep outbound queue: everyone
            // stalls in wait_and_push, nobody loses a payload.
            thread::scope(|s| {
                for _ in 0..8 {
                    s.spawn(|| {
                        for _ in 0..10_000 {
                            layer.send_message(&[1, 2, 3, 4], 1, 1).unwrap();
                        }
                    });
                }
            });
        }
        layer.flush(1).unwrap();
        layer.finish(1);
        layer.finish_communication();

        if rank == 1 {
            assert_eq!(payloads.load(Ordering::SeqCst), 80_000);
        }
    });
}

#[test]
fn termination_with_random_volumes() {
    run_ranks(2, small_buffers, |layer| {
        use rand::Rng;

        let rank = layer.comm_rank();
        let size = layer.comm_size();

        let end_markers = Arc::new(AtomicUsize::new(0));
        let markers = Arc::clone(&end_markers);
        layer
            .add_receive_callback(1, move |data, _src| {
                if data.is_empty() {
                    markers.fetch_add(1, Ordering::SeqCst);
                }
            })
            .unwrap();

        layer.init_communication();
        let mut rng = rand::thread_rng();
        for _ in 0..rng.gen_range(0..200) {
            let dst = rng.gen_range(0..size);
            layer.send_message(&[rank as u8; 4], dst, 1).unwrap();
        }
        layer.flush(1).unwrap();
        layer.finish(1);
        layer.finish_communication();

        // The remaining-sender count hit zero exactly once.
        assert_eq!(end_markers.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn misuse_is_rejected() {
    run_ranks(2, small_buffers, |layer| {
        let counter = |_: &[u8], _: usize| {};
        layer.add_receive_callback(1, counter).unwrap();
        assert!(matches!(
            layer.add_receive_callback(1, counter),
            Err(Error::CallbackExists(1))
        ));

        // Unregistered tag, out-of-range destination, oversized payload.
        assert!(matches!(
            layer.send_message(&[0], 0, 9),
            Err(Error::TagClosed(9))
        ));
        assert!(matches!(
            layer.send_message(&[0], 5, 1),
            Err(Error::InvalidRank { dst: 5, .. })
        ));
        assert!(matches!(
            layer.send_message(&[0; 64], 0, 1),
            Err(Error::MessageTooLarge { .. })
        ));
        assert!(matches!(layer.flush(9), Err(Error::UnknownTag(9))));

        layer.init_communication();
        layer.flush(1).unwrap();
        layer.finish(1);
        layer.finish_communication();
    });
}

/// Request/response stress run: every rank floods every rank with lookup
/// requests; the lookup callback answers each record on a second tag. The
/// lookup end-of-stream marker orders the answer flush: once it fires, every
/// answer for the incoming requests has been sent.
#[test]
#[serial]
fn lookup_answer_stress() {
    const LOOKUP: u32 = 13;
    const ANSWER: u32 = 12;
    let ranks = 2usize;
    let requests_per_pair = 400u32;

    fn request(src: usize, dst: usize) -> u32 {
        ((src + 1) * 100_000 + (dst + 1)) as u32
    }

    let mut handles = vec![];
    for transport in LocalFabric::create(ranks) {
        handles.push(thread::spawn(move || {
            let my_rank = transport.rank();
            let layer = Arc::new(
                CommBuilder::new(transport)
                    .with_buffer_capacity(64)
                    .build()
                    .unwrap(),
            );

            let lookups = Arc::new(AtomicUsize::new(0));
            let answers = Arc::new(AtomicUsize::new(0));
            let lookup_done = Arc::new(AtomicBool::new(false));

            let weak = Arc::downgrade(&layer);
            let lookups_seen = Arc::clone(&lookups);
            let done = Arc::clone(&lookup_done);
            layer
                .add_receive_callback(LOOKUP, move |data, src| {
                    if data.is_empty() {
                        done.store(true, Ordering::SeqCst);
                        return;
                    }
                    let layer = weak.upgrade().expect("layer outlives its callbacks");
                    for record in data.chunks_exact(4) {
                        let value = u32::from_le_bytes(record.try_into().unwrap());
                        assert_eq!(value, request(src, my_rank));
                        lookups_seen.fetch_add(1, Ordering::SeqCst);
                        layer
                            .send_message(&(value + 1000).to_le_bytes(), src, ANSWER)
                            .unwrap();
                    }
                })
                .unwrap();

            let answers_seen = Arc::clone(&answers);
            layer
                .add_receive_callback(ANSWER, move |data, src| {
                    for record in data.chunks_exact(4) {
                        let value = u32::from_le_bytes(record.try_into().unwrap());
                        assert_eq!(value, request(my_rank, src) + 1000);
                        answers_seen.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap();

            layer.init_communication();
            for _ in 0..requests_per_pair {
                for dst in 0..ranks {
                    layer
                        .send_message(&request(my_rank, dst).to_le_bytes(), dst, LOOKUP)
                        .unwrap();
                }
            }
            layer.flush(LOOKUP).unwrap();

            // Data callbacks precede the end-of-stream callback on the
            // single callback thread, so waiting here guarantees every
            // answer is committed before the answer tag closes.
            while !lookup_done.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
            layer.flush(ANSWER).unwrap();
            layer.finish(LOOKUP);
            layer.finish(ANSWER);
            layer.finish_communication();

            let expected = requests_per_pair as usize * ranks;
            assert_eq!(lookups.load(Ordering::SeqCst), expected);
            assert_eq!(answers.load(Ordering::SeqCst), expected);
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
}
