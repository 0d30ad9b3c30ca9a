//! Two command queues handed between a producer thread and the render thread.
//!
//! The producer records into the write slot returned by [`DoubleBufferedQueue::queue`]
//! and publishes it with [`DoubleBufferedQueue::swap`]. The render thread replays
//! the other slot with [`DoubleBufferedQueue::flush`].
//!
//! One producer and one flusher are expected. The producer should not swap
//! again before the flusher has consumed the previous hand-off; check
//! [`DoubleBufferedQueue::flush_pending`] to throttle. Each slot is guarded by
//! its own mutex, so breaking that cadence stalls the producer or drops a frame
//! but never exposes a half-written queue.

use super::CommandQueue;
use crate::config::QueueConfig;
use crate::device::{DeviceContext, Resettable};
use crate::error::Result;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

pub struct DoubleBufferedQueue {
    slots: [Mutex<CommandQueue>; 2],
    /// `false` selects slot 0 for writing, `true` slot 1.
    write_slot: AtomicBool,
    /// Index of the slot published by `swap` and not yet replayed, or
    /// `NOTHING_PUBLISHED`. Only a flush of that very slot clears it.
    published: AtomicU8,
}

const NOTHING_PUBLISHED: u8 = u8::MAX;

impl DoubleBufferedQueue {
    pub fn new(device: DeviceContext, vertex_capacity: usize, index_capacity: usize) -> Result<Self> {
        let first = CommandQueue::new(device.clone(), vertex_capacity, index_capacity)?;
        let second = CommandQueue::new(device, vertex_capacity, index_capacity)?;
        Ok(Self {
            slots: [Mutex::new(first), Mutex::new(second)],
            write_slot: AtomicBool::new(false),
            published: AtomicU8::new(NOTHING_PUBLISHED),
        })
    }

    pub fn from_config(device: DeviceContext, config: &QueueConfig) -> Result<Self> {
        Self::new(device, config.vertex_capacity, config.index_capacity)
    }

    fn slot(&self, index: bool) -> MutexGuard<'_, CommandQueue> {
        self.slots[index as usize]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The slot the producer records into.
    pub fn queue(&self) -> MutexGuard<'_, CommandQueue> {
        self.slot(self.write_slot.load(Ordering::Acquire))
    }

    /// Publishes the recorded slot to the flusher and hands the producer the
    /// other one, cleared.
    pub fn swap(&self) {
        let published = self.write_slot.fetch_xor(true, Ordering::AcqRel);
        let previous = self.published.swap(published as u8, Ordering::AcqRel);
        if previous != NOTHING_PUBLISHED {
            warn!("Swapping before the previous frame was flushed, dropping it");
        }

        // Blocks while the flusher still replays this slot.
        self.slot(!published).clear();
        debug!("Swapped command queues, slot {} published", published as usize);
    }

    /// Replays the slot that is not being written.
    ///
    /// The pending hand-off is acknowledged only if the replayed slot is the
    /// one last published. A swap racing with this flush stays pending.
    pub fn flush(&self) -> Result<()> {
        let read_slot = !self.write_slot.load(Ordering::Acquire);
        let result = self.slot(read_slot).flush();
        let _ = self.published.compare_exchange(
            read_slot as u8,
            NOTHING_PUBLISHED,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        result
    }

    /// Whether a swapped frame is still waiting for [`DoubleBufferedQueue::flush`].
    pub fn flush_pending(&self) -> bool {
        self.published.load(Ordering::Acquire) != NOTHING_PUBLISHED
    }
}

impl Resettable for DoubleBufferedQueue {
    fn pre_reset(&mut self) {
        for slot in &mut self.slots {
            slot.get_mut().unwrap_or_else(PoisonError::into_inner).pre_reset();
        }
    }

    fn post_reset(&mut self) -> Result<()> {
        for slot in &mut self.slots {
            slot.get_mut().unwrap_or_else(PoisonError::into_inner).post_reset()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DrawCall, HeadlessDevice};
    use crate::queue::DrawCommand;
    use crate::types::{Color, Point};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn headless() -> (Arc<Mutex<HeadlessDevice>>, DeviceContext) {
        crate::init_tracing();
        let device = Arc::new(Mutex::new(HeadlessDevice::new(4096)));
        let ctx = DeviceContext::from_shared(device.clone());
        (device, ctx)
    }

    fn rect(queue: &mut CommandQueue, count: usize) {
        for i in 0..count {
            queue.push_filled_rectangle(Point::new(i as f32, 0.0), Point::new(1.0, 1.0), Color::WHITE);
        }
    }

    #[test]
    fn test_flush_replays_pre_swap_commands() {
        let (device, ctx) = headless();
        let buffered = DoubleBufferedQueue::new(ctx, 16, 16).unwrap();

        rect(&mut buffered.queue(), 3);
        buffered.swap();
        assert!(buffered.flush_pending());
        assert!(buffered.queue().is_empty());

        // recorded after the swap, must not show up in this flush
        rect(&mut buffered.queue(), 1);
        buffered.flush().unwrap();
        assert!(!buffered.flush_pending());

        let draws = device.lock().unwrap().draw_calls();
        assert_eq!(
            draws,
            vec![DrawCall {
                base_vertex: 0,
                vertex_count: 12,
                first_index: 0,
                primitive_count: 6
            }]
        );
    }

    #[test]
    fn test_swap_clears_the_reused_slot() {
        let (_device, ctx) = headless();
        let buffered = DoubleBufferedQueue::new(ctx, 16, 16).unwrap();

        rect(&mut buffered.queue(), 1);
        buffered.swap();
        rect(&mut buffered.queue(), 2);
        buffered.flush().unwrap();
        buffered.swap();

        // the first frame's slot comes back empty
        assert!(buffered.queue().is_empty());
        assert!(matches!(
            buffered.slot(!buffered.write_slot.load(Ordering::Acquire)).commands()[0],
            DrawCommand::TriBatch { vertices: 8, .. }
        ));
    }

    #[test]
    fn test_flush_before_any_swap_is_empty() {
        let (device, ctx) = headless();
        let buffered = DoubleBufferedQueue::new(ctx, 16, 16).unwrap();
        rect(&mut buffered.queue(), 2);
        device.lock().unwrap().take_ops();

        buffered.flush().unwrap();
        assert!(device.lock().unwrap().ops().is_empty());
    }

    #[test]
    fn test_producer_and_flusher_threads() {
        let (device, ctx) = headless();
        let buffered = Arc::new(DoubleBufferedQueue::new(ctx, 16, 16).unwrap());
        const FRAMES: usize = 50;

        let producer = {
            let buffered = buffered.clone();
            thread::spawn(move || {
                for frame in 0..FRAMES {
                    while buffered.flush_pending() {
                        thread::yield_now();
                    }
                    rect(&mut buffered.queue(), frame % 4 + 1);
                    buffered.swap();
                }
            })
        };

        let mut flushed = 0;
        while flushed < FRAMES {
            if buffered.flush_pending() {
                buffered.flush().unwrap();
                flushed += 1;
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();

        let draws = device.lock().unwrap().draw_calls();
        assert_eq!(draws.len(), FRAMES);
        for (frame, draw) in draws.iter().enumerate() {
            assert_eq!(draw.vertex_count as usize, (frame % 4 + 1) * 4);
        }
    }

    #[test]
    fn test_swap_during_flush_stays_pending() {
        let (device, ctx) = headless();
        let buffered = Arc::new(DoubleBufferedQueue::new(ctx, 16, 16).unwrap());

        rect(&mut buffered.queue(), 1);
        buffered.swap();
        buffered.flush().unwrap();
        assert!(!buffered.flush_pending());

        // park the next flush on the slot it is about to replay
        let read_slot = !buffered.write_slot.load(Ordering::Acquire);
        let held = buffered.slot(read_slot);
        let flusher = {
            let buffered = buffered.clone();
            thread::spawn(move || buffered.flush().unwrap())
        };
        thread::sleep(Duration::from_millis(50));

        // the producer's swap reuses the held slot, so it blocks in `clear`
        let producer = {
            let buffered = buffered.clone();
            thread::spawn(move || {
                rect(&mut buffered.queue(), 2);
                buffered.swap();
            })
        };
        while !buffered.flush_pending() {
            thread::yield_now();
        }
        drop(held);
        flusher.join().unwrap();
        producer.join().unwrap();

        // the parked flush replayed the old slot, so frame 2 is still owed
        assert!(buffered.flush_pending());
        buffered.flush().unwrap();
        assert!(!buffered.flush_pending());

        let draws = device.lock().unwrap().draw_calls();
        assert_eq!(draws.last().map(|draw| draw.vertex_count), Some(8));
        assert_eq!(draws.iter().filter(|draw| draw.vertex_count == 8).count(), 1);
    }

    #[test]
    fn test_from_config_sizes_both_slots() {
        let (device, ctx) = headless();
        let config = QueueConfig {
            vertex_capacity: 64,
            index_capacity: 96,
        };
        let buffered = DoubleBufferedQueue::from_config(ctx, &config).unwrap();

        assert_eq!(device.lock().unwrap().live_buffers(), 4);
        for slot in [false, true] {
            let queue = buffered.slot(slot);
            assert_eq!(queue.vertex_capacity(), 64);
            assert_eq!(queue.index_capacity(), 96);
        }
    }

    #[test]
    fn test_reset_covers_both_slots() {
        let (device, ctx) = headless();
        let mut buffered = DoubleBufferedQueue::new(ctx, 16, 16).unwrap();
        assert_eq!(device.lock().unwrap().live_buffers(), 4);

        buffered.reset(true).unwrap();
        assert_eq!(device.lock().unwrap().live_buffers(), 0);
        buffered.reset(false).unwrap();
        assert_eq!(device.lock().unwrap().live_buffers(), 4);
    }
}
