/*!
    Stream decoder: the send/receive drain loop shared by audio and video.
*/

use std::sync::Arc;

use media_types::{Error, Rational, Result};
use tracing::trace;

use crate::backend::{BackendError, Container, Frame, FrameAllocator, Packet, Received};
use crate::codec::Codec;

/**
    Media-specific handling of decoded frames.

    The decoder calls [`FrameHandler::process_frame`] once per decoded frame,
    on the worker thread, before reusing the frame for the next receive.
*/
pub trait FrameHandler: Send {
    fn process_frame(&mut self, frame: &Frame, time_base: Rational) -> Result<()>;

    /// Allocator the decode context should draw picture memory from.
    fn allocator(&self) -> Option<Arc<dyn FrameAllocator>> {
        None
    }
}

/**
    A codec bound to one container stream, with the handler its frames go to.
*/
pub struct Decoder {
    stream_index: usize,
    time_base: Rational,
    codec: Codec,
    handler: Box<dyn FrameHandler>,
    frames_decoded: u64,
}

impl Decoder {
    pub fn new(stream_index: usize, time_base: Rational, handler: Box<dyn FrameHandler>) -> Self {
        Self {
            stream_index,
            time_base,
            codec: Codec::new(),
            handler,
            frames_decoded: 0,
        }
    }

    /**
        Open the codec on `container`, installing the handler's allocator.
    */
    pub fn open(&mut self, container: &mut dyn Container) -> Result<()> {
        let allocator = self.handler.allocator();
        self.codec.open(container, self.stream_index, allocator)
    }

    pub fn close(&mut self) {
        self.codec.close();
    }

    /// Container index of the stream this decoder is bound to.
    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /**
        Submit one packet and hand every frame it yields to the handler.

        Running out of output, either because more input is needed or because
        the decoder is drained, is normal completion. A decoder that refuses
        input is drained and offered the packet once more; refusing it again
        is an error, like any other decoder failure or a failure of the
        handler.
    */
    pub fn decode(&mut self, packet: &Packet) -> Result<()> {
        self.submit(Some(packet))
    }

    /**
        Drain all frames still buffered inside the decoder.
    */
    pub fn flush(&mut self) -> Result<()> {
        self.submit(None)
    }

    /**
        Discard buffered decoder state, e.g. after the container was rewound.
    */
    pub fn reset(&mut self) {
        self.codec.reset();
    }

    fn submit(&mut self, packet: Option<&Packet>) -> Result<()> {
        let stream_index = self.stream_index;
        let Some((context, _)) = self.codec.parts() else {
            return Err(decode_error(stream_index, "decoder is not open"));
        };

        match context.send_packet(packet) {
            Ok(()) => {}
            Err(BackendError::Again) => {
                // Output is full: drain it, then retry once.
                self.drain()?;
                let Some((context, _)) = self.codec.parts() else {
                    return Err(decode_error(stream_index, "decoder is not open"));
                };
                match context.send_packet(packet) {
                    Ok(()) => {}
                    Err(BackendError::Again) => {
                        return Err(decode_error(
                            stream_index,
                            "decoder still full after draining",
                        ));
                    }
                    Err(e) => return Err(decode_error(stream_index, e)),
                }
            }
            Err(BackendError::Eof) if packet.is_none() => {
                trace!(stream_index, "decoder already flushed");
            }
            Err(e) => return Err(decode_error(stream_index, e)),
        }

        self.drain()
    }

    fn drain(&mut self) -> Result<()> {
        let Self {
            stream_index,
            time_base,
            codec,
            handler,
            frames_decoded,
        } = self;
        let Some((context, frame)) = codec.parts() else {
            return Ok(());
        };

        loop {
            match context.receive_frame(frame) {
                Ok(Received::Frame) => {
                    let processed = handler.process_frame(frame, *time_base);
                    frame.unref();
                    processed?;
                    *frames_decoded += 1;
                }
                Ok(Received::Again) | Ok(Received::Eof) => return Ok(()),
                Err(e) => return Err(decode_error(*stream_index, e)),
            }
        }
    }
}

impl std::fmt::Debug for Decoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decoder")
            .field("stream_index", &self.stream_index)
            .field("time_base", &self.time_base)
            .field("codec", &self.codec)
            .field("frames_decoded", &self.frames_decoded)
            .finish_non_exhaustive()
    }
}

fn decode_error(stream_index: usize, reason: impl ToString) -> Error {
    Error::Decode {
        stream_index,
        reason: reason.to_string(),
    }
}
