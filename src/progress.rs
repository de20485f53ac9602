/// Progress reporting for programmer operations.
///
/// Wraps a handler closure called synchronously for every event.
///
/// # Example
///
/// ```
/// use ioboard_loader::Progress;
///
/// let progress = Progress::new(|event| println!("Event: {:?}", event));
/// ```
pub struct Progress {
    handler: Box<dyn FnMut(ProgressEvent) + Send>,
}

impl Progress {
    pub fn new(handler: impl FnMut(ProgressEvent) + Send + 'static) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }

    /// Progress sink discarding all events
    pub fn none() -> Self {
        Self::new(|_| ())
    }

    pub(crate) fn emit(&mut self, event: ProgressEvent) {
        (self.handler)(event);
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::none()
    }
}

#[derive(Clone, PartialEq, Debug)]
pub enum ProgressEvent {
    /// Fraction (0.0..=1.0) of the firmware file decoded
    Decoding { fraction: f32 },
    /// Opening the port and waiting for the bootloader
    Connecting,
    /// Bootloader handshake completed
    Connected,
    /// Reading from the device
    Reading { bytes: usize },
    /// Writing to the device
    Writing { bytes: usize },
    /// Flash programming percent complete, forwarded from the bootloader
    Flashing { percent: u8 },
    Finished,
    Failed,
}
