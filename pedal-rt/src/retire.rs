use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Chains retired by the audio thread wait at most this many entries.
pub const RETIRE_QUEUE_SIZE: usize = 128;

const DRAIN_INTERVAL: Duration = Duration::from_millis(10);

/// Background destroyer for values the audio thread must not drop itself.
///
/// Dropping a retired chain runs FFT teardowns, IR buffer frees and model
/// teardowns; the worker keeps all of that off the realtime path. On `stop`
/// the queue is drained to completion before the thread exits.
pub struct RetireWorker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl RetireWorker {
    pub fn spawn<T: Send + 'static>(mut rx: rtrb::Consumer<T>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = std::thread::Builder::new()
            .name("pedal-retire".into())
            .spawn(move || {
                while !stop_flag.load(Ordering::Relaxed) {
                    while let Ok(item) = rx.pop() {
                        drop(item);
                    }
                    std::thread::sleep(DRAIN_INTERVAL);
                }
                // Final drain so nothing queued at shutdown leaks.
                while let Ok(item) = rx.pop() {
                    drop(item);
                }
            })
            .expect("failed to spawn retire thread");

        Self {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RetireWorker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct DropProbe(Arc<AtomicUsize>);
    impl Drop for DropProbe {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn every_accepted_handle_is_dropped_exactly_once() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (mut tx, rx) = rtrb::RingBuffer::new(RETIRE_QUEUE_SIZE);

        let worker = RetireWorker::spawn(rx);
        let mut accepted = 0usize;
        for _ in 0..32 {
            if tx.push(DropProbe(Arc::clone(&drops))).is_ok() {
                accepted += 1;
            }
        }
        worker.stop();
        assert_eq!(drops.load(Ordering::SeqCst), accepted);
    }

    #[test]
    fn full_ring_hands_the_item_back() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (mut tx, rx) = rtrb::RingBuffer::new(2);

        tx.push(DropProbe(Arc::clone(&drops))).unwrap();
        tx.push(DropProbe(Arc::clone(&drops))).unwrap();
        // Producer keeps ownership on a full ring; nothing is destroyed.
        let back = tx.push(DropProbe(Arc::clone(&drops)));
        assert!(back.is_err());
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        let rtrb::PushError::Full(probe) = back.unwrap_err();
        drop(probe);
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        let worker = RetireWorker::spawn(rx);
        worker.stop();
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn stop_drains_pending_items() {
        let drops = Arc::new(AtomicUsize::new(0));
        let (mut tx, rx) = rtrb::RingBuffer::new(8);
        let worker = RetireWorker::spawn(rx);
        for _ in 0..8 {
            let _ = tx.push(DropProbe(Arc::clone(&drops)));
        }
        worker.stop();
        assert_eq!(drops.load(Ordering::SeqCst), 8);
    }
}
