use std::sync::Arc;

use media_types::{Error, Result};
use tracing::debug;

use crate::backend::{Container, DecodeContext, Frame, FrameAllocator};

/**
    Owns one opened decode context and the frame it decodes into.

    Opening binds the codec to a container stream; closing releases both the
    context and the frame. `close` is idempotent and also runs on drop.
*/
pub struct Codec {
    context: Option<Box<dyn DecodeContext>>,
    frame: Frame,
}

impl Codec {
    pub fn new() -> Self {
        Self {
            context: None,
            frame: Frame::empty(),
        }
    }

    /**
        Open a decoder for `stream_index` on `container`.

        Any failure while locating, configuring or opening the decoder is
        reported as [`Error::DecoderInit`].
    */
    pub fn open(
        &mut self,
        container: &mut dyn Container,
        stream_index: usize,
        allocator: Option<Arc<dyn FrameAllocator>>,
    ) -> Result<()> {
        self.close();
        let context = container
            .open_decoder(stream_index, allocator)
            .map_err(|e| Error::DecoderInit {
                stream_index,
                reason: e.to_string(),
            })?;
        debug!(stream_index, "decoder opened");
        self.context = Some(context);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.context.is_some()
    }

    pub fn close(&mut self) {
        if self.context.take().is_some() {
            debug!("decoder closed");
        }
        self.frame = Frame::empty();
    }

    /// Discard the decoder's buffered state.
    pub fn reset(&mut self) {
        if let Some(context) = self.context.as_mut() {
            context.reset();
        }
        self.frame.unref();
    }

    pub(crate) fn parts(&mut self) -> Option<(&mut dyn DecodeContext, &mut Frame)> {
        let context = self.context.as_deref_mut()?;
        Some((context, &mut self.frame))
    }
}

impl Default for Codec {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Codec {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}
