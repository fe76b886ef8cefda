//! Hardware encode device.
//!
//! The session hands every configured frame to an [`EncodeDevice`] and polls
//! it for the coded tile data on a later scheduler turn. Submission never
//! blocks: a full device answers [`Status::DeviceBusy`] and the task stays
//! queued.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::encoder::dpb::RecHandle;
use crate::encoder::{FrameType, RawSurface, MAX_QP, REFS_PER_FRAME};
use crate::error::{EncodeError, Result, Status};

/// Everything the device needs to encode one frame.
#[derive(Debug, Clone)]
pub struct DeviceFrame {
    pub task_id: usize,
    pub display_order: u32,
    pub encoded_order: u32,
    pub frame_type: FrameType,
    pub qp: u8,
    pub surface: Option<Arc<RawSurface>>,
    /// Reconstruction target.
    pub rec: RecHandle,
    /// Reconstructions referenced through LAST..ALTREF.
    pub refs: [Option<RecHandle>; REFS_PER_FRAME],
}

/// Coded output of one frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceOutput {
    /// Tile group payload, without any OBU header.
    pub tile_data: Vec<u8>,
}

/// Asynchronous encode engine.
pub trait EncodeDevice: Send {
    /// Queues a frame. Returns `Status::DeviceBusy` when the queue is full.
    fn submit(&mut self, frame: &DeviceFrame) -> Result<Status>;

    /// Returns the output of `task_id` once the device is done with it.
    fn query(&mut self, task_id: usize) -> Result<Option<DeviceOutput>>;

    /// Drops all queued work.
    fn reset(&mut self);
}

struct InFlight {
    frame: DeviceFrame,
    polls_left: u32,
}

/// Software stand-in for the hardware encoder.
///
/// Output sizes follow the quantizer and frame type, so rate control sees a
/// plausible response. Tile bytes are a deterministic pattern.
pub struct SyntheticDevice {
    width: u32,
    height: u32,
    max_in_flight: usize,
    latency: u32,
    scale: f64,
    hang_at: Option<u32>,
    in_flight: HashMap<usize, InFlight>,
    history: VecDeque<(u32, u8)>,
}

impl SyntheticDevice {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            max_in_flight: 4,
            latency: 1,
            scale: 1.0,
            hang_at: None,
            in_flight: HashMap::new(),
            history: VecDeque::new(),
        }
    }

    /// Frames the device accepts before reporting busy.
    pub fn with_capacity(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }

    /// Query calls that report "not done" before a frame completes.
    pub fn with_latency(mut self, polls: u32) -> Self {
        self.latency = polls;
        self
    }

    /// Multiplies every output size.
    pub fn with_size_scale(mut self, scale: f64) -> Self {
        self.scale = scale;
        self
    }

    /// Reports a GPU hang when the frame with this encode order is queried.
    pub fn with_hang_at(mut self, encoded_order: u32) -> Self {
        self.hang_at = Some(encoded_order);
        self
    }

    /// `(display_order, qp)` of every submission, oldest first.
    pub fn submissions(&self) -> impl Iterator<Item = &(u32, u8)> {
        self.history.iter()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Coded size in bytes for a frame of `frame_type` at `qp`.
    pub fn coded_size(&self, frame_type: FrameType, qp: u8) -> usize {
        let blocks = (self.width as f64 * self.height as f64) / 32.0;
        let weight = if frame_type.is_i() {
            4.0
        } else if frame_type.is_b() {
            0.5
        } else {
            1.0
        };
        let fidelity = (MAX_QP as f64 + 1.0 - qp as f64) / (MAX_QP as f64 + 1.0);
        ((blocks * weight * fidelity * self.scale) as usize).max(8)
    }
}

impl EncodeDevice for SyntheticDevice {
    fn submit(&mut self, frame: &DeviceFrame) -> Result<Status> {
        if self.in_flight.len() >= self.max_in_flight {
            trace!(task = frame.task_id, "device busy");
            return Ok(Status::DeviceBusy);
        }
        if self.in_flight.contains_key(&frame.task_id) {
            return Err(EncodeError::Device(format!(
                "task {} submitted twice",
                frame.task_id
            )));
        }
        debug!(
            "Device submit: task {} display={} encoded={} qp={}",
            frame.task_id, frame.display_order, frame.encoded_order, frame.qp
        );
        self.history.push_back((frame.display_order, frame.qp));
        self.in_flight.insert(
            frame.task_id,
            InFlight {
                frame: frame.clone(),
                polls_left: self.latency,
            },
        );
        Ok(Status::Ok)
    }

    fn query(&mut self, task_id: usize) -> Result<Option<DeviceOutput>> {
        let Some(entry) = self.in_flight.get_mut(&task_id) else {
            return Err(EncodeError::Device(format!("task {task_id} is not in flight")));
        };
        if entry.polls_left > 0 {
            entry.polls_left -= 1;
            return Ok(None);
        }
        let Some(InFlight { frame, .. }) = self.in_flight.remove(&task_id) else {
            return Ok(None);
        };
        if self.hang_at == Some(frame.encoded_order) {
            warn!("Synthetic GPU hang at encoded order {}", frame.encoded_order);
            return Err(EncodeError::GpuHang(frame.encoded_order));
        }

        let size = self.coded_size(frame.frame_type, frame.qp);
        let seed = frame.display_order as u8;
        let tile_data = (0..size).map(|i| seed ^ (i as u8)).collect();
        Ok(Some(DeviceOutput { tile_data }))
    }

    fn reset(&mut self) {
        self.in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(task_id: usize, frame_type: FrameType, qp: u8) -> DeviceFrame {
        DeviceFrame {
            task_id,
            display_order: task_id as u32,
            encoded_order: task_id as u32,
            frame_type,
            qp,
            surface: None,
            rec: RecHandle(task_id as u16),
            refs: [None; REFS_PER_FRAME],
        }
    }

    #[test]
    fn test_latency_and_output() {
        let mut device = SyntheticDevice::new(64, 64).with_latency(2);
        assert_eq!(device.submit(&frame(0, FrameType::I, 100)).unwrap(), Status::Ok);
        assert!(device.query(0).unwrap().is_none());
        assert!(device.query(0).unwrap().is_none());
        let out = device.query(0).unwrap().unwrap();
        assert_eq!(out.tile_data.len(), device.coded_size(FrameType::I, 100));
        assert!(device.query(0).is_err());
    }

    #[test]
    fn test_busy_when_full() {
        let mut device = SyntheticDevice::new(64, 64).with_capacity(1).with_latency(0);
        assert_eq!(device.submit(&frame(0, FrameType::P, 100)).unwrap(), Status::Ok);
        assert_eq!(device.submit(&frame(1, FrameType::P, 100)).unwrap(), Status::DeviceBusy);
        device.query(0).unwrap().unwrap();
        assert_eq!(device.submit(&frame(1, FrameType::P, 100)).unwrap(), Status::Ok);
        assert_eq!(device.submissions().count(), 2);
    }

    #[test]
    fn test_size_follows_qp_and_type() {
        let device = SyntheticDevice::new(320, 240);
        assert!(device.coded_size(FrameType::I, 100) > device.coded_size(FrameType::P, 100));
        assert!(device.coded_size(FrameType::P, 100) > device.coded_size(FrameType::B, 100));
        assert!(device.coded_size(FrameType::P, 40) > device.coded_size(FrameType::P, 200));
    }

    #[test]
    fn test_injected_hang() {
        let mut device = SyntheticDevice::new(64, 64).with_latency(0).with_hang_at(1);
        device.submit(&frame(0, FrameType::I, 100)).unwrap();
        device.submit(&frame(1, FrameType::P, 100)).unwrap();
        assert!(device.query(0).unwrap().is_some());
        assert!(matches!(device.query(1), Err(EncodeError::GpuHang(1))));
    }
}
