// SPDX-License-Identifier: GPL-3.0-only

//! Single-slot frame exchange between the capture tick and the renderer
//!
//! Two output buffers rotate between a producer and a consumer. The producer
//! fills the back buffer without holding the lock, then swaps it to the front
//! and raises the "new data" flag. The consumer takes the front buffer out
//! under the lock and reads it after the lock is released; while it is out,
//! nothing else can write to it. An undelivered frame is replaced by the next
//! one (at most one pending frame).
//!
//! ```ignore
//! if let Some(mut slot) = handoff.begin_write() {
//!     fill(slot.pixels_mut());
//!     slot.publish();
//! }
//!
//! handoff.consume(|frame| upload(frame.pixels, frame.geometry));
//! ```

use std::sync::{Mutex, MutexGuard};

/// Shape of the frames travelling through the handoff
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameGeometry {
    pub width: u32,
    pub height: u32,
    /// Bytes per output row
    pub pitch: usize,
}

impl FrameGeometry {
    pub fn new(width: u32, height: u32, pitch: usize) -> Self {
        Self {
            width,
            height,
            pitch,
        }
    }

    /// Bytes in one frame
    pub fn frame_len(&self) -> usize {
        self.pitch * self.height as usize
    }

    pub fn is_empty(&self) -> bool {
        self.frame_len() == 0
    }
}

/// A delivered frame, borrowed for the duration of a `consume` call
#[derive(Debug)]
pub struct FrameView<'a> {
    pub pixels: &'a [u8],
    pub geometry: FrameGeometry,
}

struct Slots {
    front: Option<Vec<u8>>,
    back: Option<Vec<u8>>,
    new_data: bool,
    geometry: FrameGeometry,
    /// Bumped on every reallocation; buffers from older generations are dropped
    generation: u64,
}

impl Slots {
    /// Return a buffer that was lent out, if it still fits
    fn give_back(&mut self, pixels: Vec<u8>, generation: u64) {
        if generation != self.generation {
            return;
        }
        if self.front.is_none() && !self.new_data {
            self.front = Some(pixels);
        } else if self.back.is_none() {
            self.back = Some(pixels);
        }
    }
}

/// Double-buffered frame slot
pub struct FrameHandoff {
    slots: Mutex<Slots>,
}

impl Default for FrameHandoff {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameHandoff {
    /// An empty handoff; nothing can be written until [`HandoffGuard::reallocate`]
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                front: None,
                back: None,
                new_data: false,
                geometry: FrameGeometry::default(),
                generation: 0,
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.slots().geometry
    }

    /// Whether a frame is waiting to be consumed
    pub fn has_new_data(&self) -> bool {
        self.slots().new_data
    }

    /// Borrow the back buffer for writing
    ///
    /// Returns `None` when no buffer is free (not allocated yet, or the
    /// consumer still holds the other one); the frame is then dropped.
    pub fn begin_write(&self) -> Option<WriteSlot<'_>> {
        let mut slots = self.slots();
        let pixels = slots.back.take()?;
        Some(WriteSlot {
            handoff: self,
            pixels: Some(pixels),
            geometry: slots.geometry,
            generation: slots.generation,
        })
    }

    /// Deliver the pending frame, if any, to `f`
    ///
    /// The lock is only held to take the front buffer out and to put it
    /// back; `f` runs without it. Returns whether a frame was delivered.
    pub fn consume<F>(&self, f: F) -> bool
    where
        F: FnOnce(FrameView<'_>),
    {
        let (pixels, geometry, generation) = {
            let mut slots = self.slots();
            if !slots.new_data {
                return false;
            }
            let Some(pixels) = slots.front.take() else {
                slots.new_data = false;
                return false;
            };
            slots.new_data = false;
            (pixels, slots.geometry, slots.generation)
        };

        f(FrameView {
            pixels: &pixels,
            geometry,
        });

        self.slots().give_back(pixels, generation);
        true
    }

    /// Exclusive access for reallocation; blocks producer and consumer
    pub fn exclusive(&self) -> HandoffGuard<'_> {
        HandoffGuard {
            slots: self.slots(),
        }
    }
}

/// The back buffer, lent to the producer
pub struct WriteSlot<'a> {
    handoff: &'a FrameHandoff,
    pixels: Option<Vec<u8>>,
    geometry: FrameGeometry,
    generation: u64,
}

impl WriteSlot<'_> {
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        self.pixels.as_deref_mut().unwrap_or_default()
    }

    /// Swap the written buffer to the front and flag it as new
    pub fn publish(mut self) {
        let Some(pixels) = self.pixels.take() else {
            return;
        };
        let mut slots = self.handoff.slots();
        if slots.generation != self.generation {
            return;
        }
        let previous = slots.front.replace(pixels);
        if slots.back.is_none() {
            slots.back = previous;
        }
        slots.new_data = true;
    }
}

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        // Unpublished: the buffer goes back to being the back buffer
        if let Some(pixels) = self.pixels.take() {
            let mut slots = self.handoff.slots();
            if slots.generation == self.generation && slots.back.is_none() {
                slots.back = Some(pixels);
            }
        }
    }
}

/// Holds the handoff lock
pub struct HandoffGuard<'a> {
    slots: MutexGuard<'a, Slots>,
}

impl HandoffGuard<'_> {
    /// Drop both buffers and allocate fresh ones for `geometry`
    pub fn reallocate(&mut self, geometry: FrameGeometry) {
        let len = geometry.frame_len();
        self.slots.generation += 1;
        self.slots.geometry = geometry;
        self.slots.new_data = false;
        if len == 0 {
            self.slots.front = None;
            self.slots.back = None;
        } else {
            self.slots.front = Some(vec![0; len]);
            self.slots.back = Some(vec![0; len]);
        }
    }

    /// Drop both buffers; nothing can be written until the next reallocation
    pub fn clear(&mut self) {
        self.reallocate(FrameGeometry::default());
    }

    pub fn geometry(&self) -> FrameGeometry {
        self.slots.geometry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn handoff(width: u32, height: u32) -> FrameHandoff {
        let handoff = FrameHandoff::new();
        handoff
            .exclusive()
            .reallocate(FrameGeometry::new(width, height, width as usize * 4));
        handoff
    }

    fn write_frame(handoff: &FrameHandoff, value: u8) -> bool {
        match handoff.begin_write() {
            Some(mut slot) => {
                slot.pixels_mut().fill(value);
                slot.publish();
                true
            }
            None => false,
        }
    }

    #[test]
    fn test_nothing_to_consume_initially() {
        let handoff = handoff(4, 4);
        assert!(!handoff.consume(|_| panic!("no frame was published")));
    }

    #[test]
    fn test_unallocated_handoff_refuses_writes() {
        let handoff = FrameHandoff::new();
        assert!(handoff.begin_write().is_none());
    }

    #[test]
    fn test_latest_frame_wins() {
        let handoff = handoff(4, 4);
        assert!(write_frame(&handoff, 1));
        assert!(write_frame(&handoff, 2));

        let mut seen = None;
        assert!(handoff.consume(|frame| seen = Some(frame.pixels[0])));
        assert_eq!(seen, Some(2));
        assert!(!handoff.consume(|_| {}));
    }

    #[test]
    fn test_dropped_slot_returns_buffer() {
        let handoff = handoff(4, 4);
        drop(handoff.begin_write());
        assert!(handoff.begin_write().is_some());
        assert!(!handoff.has_new_data());
    }

    #[test]
    fn test_reallocation_discards_pending_frame() {
        let handoff = handoff(4, 4);
        let mut slot = handoff.begin_write().unwrap();
        slot.pixels_mut().fill(9);

        handoff.exclusive().reallocate(FrameGeometry::new(8, 2, 32));
        // Buffer from the previous generation is ignored
        slot.publish();
        assert!(!handoff.has_new_data());

        assert!(write_frame(&handoff, 3));
        handoff.consume(|frame| {
            assert_eq!(frame.geometry, FrameGeometry::new(8, 2, 32));
            assert_eq!(frame.pixels.len(), 64);
        });
    }

    #[test]
    fn test_consumer_never_sees_torn_frames() {
        const FRAMES: u32 = 2000;
        let handoff = Arc::new(handoff(32, 8));
        let done = Arc::new(AtomicBool::new(false));

        let producer = {
            let handoff = Arc::clone(&handoff);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                for seq in 1..=FRAMES {
                    // No free buffer means the consumer is reading; drop the frame
                    if let Some(mut slot) = handoff.begin_write() {
                        let pixels = slot.pixels_mut();
                        let len = pixels.len();
                        pixels.fill(seq as u8);
                        pixels[..4].copy_from_slice(&seq.to_le_bytes());
                        pixels[len - 4..].copy_from_slice(&seq.to_le_bytes());
                        slot.publish();
                    }
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        let mut deliveries = 0u32;
        let mut last_seq = 0u32;
        loop {
            let finished = done.load(Ordering::SeqCst);
            handoff.consume(|frame| {
                let p = frame.pixels;
                let head = u32::from_le_bytes(p[..4].try_into().unwrap());
                let tail = u32::from_le_bytes(p[p.len() - 4..].try_into().unwrap());
                assert_eq!(head, tail, "torn frame");
                assert!(p[4..p.len() - 4].iter().all(|&b| b == head as u8), "torn frame");
                assert!(head > last_seq, "frame {} delivered after {}", head, last_seq);
                last_seq = head;
                deliveries += 1;
            });
            if finished && !handoff.has_new_data() {
                break;
            }
        }

        producer.join().unwrap();
        assert!(deliveries >= 1);
        assert!(deliveries <= FRAMES);
    }
}
