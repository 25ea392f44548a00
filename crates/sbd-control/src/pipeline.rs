//! Data pipeline stages.
//!
//! Stages sit between the kernel handler and the tree engine and transform
//! values in transit (compression, encryption). The controller gives each
//! stage two hooks: parameter binding before any device work, and device
//! finalization once the backing store is up and the calculated node size is
//! known — some stages cannot size their buffers before that.

use crate::StartOptions;
use sbd_error::Result;
use sbd_types::DeviceSpec;

/// One stage in the data pipeline.
///
/// The default hook implementations make a stage stateless; `encode` and
/// `decode` must be exact inverses and must not grow a value beyond the
/// entry capacity.
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once per start invocation, before any device work.
    fn bind_parameters(&mut self, _options: &StartOptions) -> Result<()> {
        Ok(())
    }

    /// Called after the backing store is up; `spec` carries the finalized
    /// `node_calculated_size` and `alignment`.
    fn finalize_device(&mut self, _spec: &DeviceSpec) -> Result<()> {
        Ok(())
    }

    /// Transform a value on its way into the store.
    fn encode(&self, data: Vec<u8>) -> Result<Vec<u8>>;

    /// Inverse transform on the way back out.
    fn decode(&self, data: Vec<u8>) -> Result<Vec<u8>>;
}

/// Ordered stage list; encode runs front to back, decode back to front.
pub type Pipeline = Vec<Box<dyn PipelineStage>>;

pub(crate) fn encode_through(pipeline: &[Box<dyn PipelineStage>], data: Vec<u8>) -> Result<Vec<u8>> {
    pipeline
        .iter()
        .try_fold(data, |data, stage| stage.encode(data))
}

pub(crate) fn decode_through(pipeline: &[Box<dyn PipelineStage>], data: Vec<u8>) -> Result<Vec<u8>> {
    pipeline
        .iter()
        .rev()
        .try_fold(data, |data, stage| stage.decode(data))
}
