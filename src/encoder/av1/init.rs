use super::Av1Encoder;

use crate::encoder::device::EncodeDevice;
use crate::encoder::enctools::{Av1EncTools, BuiltinEncTools, EncToolsEngine};
use crate::encoder::general::General;
use crate::encoder::gop::GopStructure;
use crate::encoder::packer::Packer;
use crate::encoder::pipeline::assemble_pipeline;
use crate::encoder::reorder::Reorderer;
use crate::encoder::session::{input_frame_size, EncoderCore};
use crate::encoder::task_manager::{num_task, TaskManager};
use crate::encoder::EncodeConfig;
use crate::error::{EncodeError, Result, Status};
use tracing::{debug, info, warn};

impl Av1Encoder {
    /// Create a new AV1 encode session.
    ///
    /// `engine` replaces the built-in look-ahead and rate control when the
    /// configuration enables EncTools. The returned session reports
    /// parameter corrections through [`Av1Encoder::init_status`].
    pub fn new(
        config: EncodeConfig,
        device: Box<dyn EncodeDevice>,
        engine: Option<Box<dyn EncToolsEngine>>,
    ) -> Result<Self> {
        info!(
            "Creating AV1 encoder: requested {}x{}, pixel_format={:?}, rc={:?}",
            config.dimensions.width,
            config.dimensions.height,
            config.pixel_format,
            config.rate_control_mode
        );

        let (general, status) = General::new(config)?;

        let enc_tools = if general.config.enc_tools {
            let engine = engine.unwrap_or_else(|| Box::new(BuiltinEncTools::new()));
            let enc_tools = Av1EncTools::new(engine, &general.config)?;
            enc_tools.active_config().is_on().then_some(enc_tools)
        } else {
            None
        };
        let la_delay = enc_tools.as_ref().map_or(0, |e| e.delay());
        let brc = enc_tools.as_ref().is_some_and(|e| e.active_config().brc);

        let num_task = num_task(&general.config, la_delay);
        // A recode must reach the device before any later frame.
        let max_in_flight = if brc {
            1
        } else {
            general.config.async_depth as usize
        };

        let core = EncoderCore::new(general, device, enc_tools, num_task)?;
        info!(
            "AV1 encoder ready: {} tasks, {} reconstructed surfaces, look-ahead {} frames",
            num_task,
            core.pool.capacity(),
            la_delay
        );

        Ok(Self {
            core,
            pipeline: assemble_pipeline(),
            tasks: TaskManager::new(num_task, max_in_flight),
            init_status: status,
            flushing: false,
            closed: false,
        })
    }

    /// Status of the last init or reset: `ParamCorrected` when a parameter
    /// was adjusted.
    pub fn init_status(&self) -> Status {
        self.init_status
    }

    pub(super) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(EncodeError::NotInitialized);
        }
        Ok(())
    }

    /// Applies a new configuration.
    ///
    /// A change of the sequence header, resolution, GOP structure or rate
    /// control starts a new sequence: buffered frames are cancelled without
    /// output, frames already on the device are finished, and the next frame
    /// is an IDR. Other changes apply from the next configured frame.
    pub fn reset(&mut self, config: EncodeConfig) -> Result<Status> {
        self.ensure_open()?;
        let (general, status) = General::new(config)?;

        let needed = num_task(&general.config, self.core.la_delay());
        if needed > self.tasks.num_task() {
            return Err(EncodeError::UnsupportedConfig(format!(
                "reset needs {} tasks, session was created with {}",
                needed,
                self.tasks.num_task()
            )));
        }

        let old = &self.core.general.config;
        let new = &general.config;
        let new_sequence = general.sh != self.core.general.sh
            || new.dimensions != old.dimensions
            || new.gop_pic_size != old.gop_pic_size
            || new.gop_ref_dist != old.gop_ref_dist
            || new.b_ref_type != old.b_ref_type
            || new.rate_control_mode != old.rate_control_mode
            || new.target_kbps != old.target_kbps
            || new.max_kbps != old.max_kbps;

        if new_sequence {
            self.restart_sequence(general)?;
        } else {
            self.core.packer = Packer::new(&general.sh, &general.config)?;
            self.core.general = general;
        }

        self.init_status = status;
        info!(
            "AV1 encoder reset: {}x{} new_sequence={} status={:?}",
            self.core.general.config.dimensions.width,
            self.core.general.config.dimensions.height,
            new_sequence,
            status
        );
        Ok(status)
    }

    fn restart_sequence(&mut self, general: General) -> Result<()> {
        self.cancel_buffered();
        self.run_until_idle()?;

        let core = &mut self.core;
        core.output.discard_pending();
        core.output
            .set_next_encoded(core.state.last_encoded_order.map_or(0, |o| o + 1));
        // The IVF stream header was already written.
        let first_frame = core.state.first_frame;
        core.state.reset(&mut core.pool);
        core.state.first_frame = first_frame;

        let config = &general.config;
        core.packer = Packer::new(&general.sh, config)?;
        core.gop = GopStructure::new(config);
        core.reorderer = Box::new(Reorderer::new(config.b_ref_type));
        core.next_display_order = 0;
        core.frame_size = input_frame_size(config);
        if let Some(enc_tools) = core.enc_tools.as_mut() {
            enc_tools.reset(config)?;
        }
        core.general = general;
        debug!("New sequence starts at encoded order {}", core.output.next_encoded());
        Ok(())
    }

    /// Cancels every task the device has not seen yet.
    pub(super) fn cancel_buffered(&mut self) {
        for task in self.tasks.cancel_tasks() {
            self.abort_task(task);
        }
    }

    /// Ends the session. Buffered frames and frames on the device are
    /// dropped without output.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.cancel_buffered();
        self.core.device.reset();
        while let Some(task) = self.tasks.pop_submitted() {
            self.abort_task(task);
        }
        while let Some(task) = self.tasks.pop_done() {
            self.abort_task(task);
        }

        let core = &mut self.core;
        core.output.discard_pending();
        core.state.reset(&mut core.pool);
        if let Some(enc_tools) = core.enc_tools.as_mut() {
            enc_tools.close();
        }
        self.closed = true;
        info!(
            "AV1 encoder closed after {} frames",
            core.state.last_encoded_order.map_or(0, |o| o + 1)
        );
        Ok(())
    }
}

impl Drop for Av1Encoder {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Closing AV1 encoder failed: {}", e);
        }
    }
}
