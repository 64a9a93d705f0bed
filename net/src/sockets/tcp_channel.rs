use log::{error, info, warn};
use std::{
    io::{ErrorKind, Read, Write},
    net::TcpStream,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{Receiver, Sender, TryRecvError},
        Arc,
    },
    thread,
    time::Duration,
};

#[cfg(debug_assertions)]
use log::debug;

use super::{buffer_pool::BufferPool, MessageLength};

const IDLE_SLEEP_DURATION: Duration = Duration::from_millis(10);
const MESSAGE_LENGTH_SIZE: usize = size_of::<MessageLength>();
const MAX_MESSAGE_SIZE: usize = 1024;
const RECEIVE_BUFFER_SIZE: usize = MAX_MESSAGE_SIZE << 2;
const MAX_TX_RETRY_COUNT: usize = 5;
const TX_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Owns the thread that services one link to another node. Frames posted to
/// the paired channel are written to the Tcp stream with a length prefix, and
/// frames extracted from the stream are posted back on the other channel.
/// The channel never disconnects an idle link, liveness is decided by the
/// heart beat protocol layered on top of it.
pub struct LinkChannel {
    stop_signal: Arc<AtomicBool>,
}

impl LinkChannel {
    pub fn new(
        receiver: Receiver<Vec<u8>>,
        sender: Sender<Vec<u8>>,
        stream: TcpStream,
        buffer_pool: &Arc<BufferPool>,
        stop_signal: &Arc<AtomicBool>,
    ) -> Self {
        let thread = LinkThread::new(receiver, sender, stream, buffer_pool, stop_signal);
        thread::spawn(move || thread.run());

        Self {
            stop_signal: stop_signal.clone(),
        }
    }

    pub fn stop(self: &Self) {
        if !self.stop_signal.load(Ordering::Relaxed) {
            self.stop_signal.store(true, Ordering::Relaxed);
            info!("LinkChannel: Stopped");
        }
    }
}

impl Drop for LinkChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

struct LinkThread {
    stream: TcpStream,
    buffer_pool: Arc<BufferPool>,
    stop_signal: Arc<AtomicBool>,

    channel_rx: Receiver<Vec<u8>>,
    channel_tx: Sender<Vec<u8>>,

    receive_buffer: [u8; RECEIVE_BUFFER_SIZE],
    receive_buffer_count: usize,
    consumed_count: usize,
}

impl LinkThread {
    fn new(
        receiver: Receiver<Vec<u8>>,
        sender: Sender<Vec<u8>>,
        stream: TcpStream,
        buffer_pool: &Arc<BufferPool>,
        stop_signal: &Arc<AtomicBool>,
    ) -> Self {
        Self {
            stream,
            buffer_pool: buffer_pool.clone(),
            stop_signal: stop_signal.clone(),

            channel_rx: receiver,
            channel_tx: sender,

            receive_buffer: [0u8; RECEIVE_BUFFER_SIZE],
            receive_buffer_count: 0,
            consumed_count: 0,
        }
    }

    fn run(mut self: Self) {
        info!("LinkThread: Started");
        if let Err(e) = self.stream.set_nonblocking(true) {
            self.fatal(&format!("Could not make the Tcp stream non-blocking: {e}"));
        }
        while !self.stop_signal.load(Ordering::Relaxed) {
            let sent = self.try_send();
            let received = self.try_receive();
            self.try_extract_received();
            if !sent && !received {
                thread::sleep(IDLE_SLEEP_DURATION);
            }
        }
        info!("LinkThread: Stopped");
        // Dropping self closes channel_tx, which is how the owner of the
        // other end finds out that this link is gone.
    }

    fn stop(self: &mut Self) {
        self.stop_signal.store(true, Ordering::Relaxed);
    }

    fn fatal(self: &mut Self, msg: &str) {
        info!("LinkThread: {}", msg);
        self.stop();
    }

    fn try_send(self: &mut Self) -> bool {
        let message = match self.channel_rx.try_recv() {
            Ok(message) => message,
            Err(e) => match e {
                TryRecvError::Empty => return false,
                TryRecvError::Disconnected => {
                    self.fatal("Channel receiver disconnected");
                    return false;
                }
            },
        };

        let len = message.len();
        if len + MESSAGE_LENGTH_SIZE > MAX_MESSAGE_SIZE {
            error!("LinkThread Tx: {len} exceeds maximum frame length and cannot be sent");
            self.buffer_pool.reuse(message);
            return false;
        }
        let length: MessageLength = len
            .try_into()
            .expect("LinkThread Tx: Frame length must fit into MessageLength type");

        let length_bytes = length.to_le_bytes();
        if self.send(&length_bytes) {
            let _ = self.send(&message[..]);
        }
        self.buffer_pool.reuse(message);
        true
    }

    fn send(self: &mut Self, buf: &[u8]) -> bool {
        let mut retry_count = 0;
        loop {
            #[cfg(debug_assertions)]
            debug!("LinkThread Tx: Sending {buf:?}");

            match self.stream.write(buf) {
                Ok(_) => {
                    return true;
                }
                Err(e) => match e.kind() {
                    ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
                    | ErrorKind::NotConnected => {
                        self.fatal("Tx stream closed by other party");
                        return false;
                    }
                    ErrorKind::WouldBlock => {}
                    ErrorKind::TimedOut => {
                        warn!("LinkThread Tx: Timeout writing to Tcp stream: {e}");
                    }
                    _ => {}
                },
            }
            retry_count += 1;
            if retry_count > MAX_TX_RETRY_COUNT {
                self.fatal("Retry count exceeded writing frame to Tcp stream");
                return false;
            } else {
                thread::sleep(TX_RETRY_INTERVAL);
            }
        }
    }

    fn try_receive(self: &mut Self) -> bool {
        match self
            .stream
            .read(&mut self.receive_buffer[self.receive_buffer_count..])
        {
            Ok(0) => {
                self.fatal("Rx stream closed by other party");
                false
            }
            Ok(byte_count) => {
                #[cfg(debug_assertions)]
                debug!("LinkThread Rx: Received {byte_count} bytes");
                self.receive_buffer_count += byte_count;
                true
            }
            Err(e) => {
                match e.kind() {
                    ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected => {
                        self.fatal("Rx stream closed by other party");
                    }
                    ErrorKind::WouldBlock => {}
                    ErrorKind::TimedOut => {
                        warn!("LinkThread Rx: Timeout reading from Tcp stream");
                    }
                    _ => {}
                }
                false
            }
        }
    }

    fn try_extract_received(self: &mut Self) {
        loop {
            let residual_byte_count = self.receive_buffer_count - self.consumed_count;
            if residual_byte_count < MESSAGE_LENGTH_SIZE {
                break;
            }

            let length_start_index = self.consumed_count;
            let length_end_index = length_start_index + MESSAGE_LENGTH_SIZE;
            let length_bytes = self.receive_buffer[length_start_index..length_end_index]
                .try_into()
                .unwrap();
            let message_length = MessageLength::from_le_bytes(length_bytes);

            let entire_length = MESSAGE_LENGTH_SIZE + message_length as usize;
            if residual_byte_count < entire_length {
                break;
            }

            let mut message = self.buffer_pool.get(message_length);
            let message_start_index = self.consumed_count + MESSAGE_LENGTH_SIZE;
            let message_end_index = message_start_index + (message_length as usize);
            message.copy_from_slice(&self.receive_buffer[message_start_index..message_end_index]);

            #[cfg(debug_assertions)]
            debug!("LinkThread Rx: Extracted frame {message:?}");

            self.consumed_count += entire_length;

            if let Err(e) = self.channel_tx.send(message) {
                self.fatal(&format!("Failed to post frame to channel: {e}"));
                return;
            }
        }

        let residual_byte_count = self.receive_buffer_count - self.consumed_count;
        if residual_byte_count == 0 {
            self.receive_buffer_count = 0;
            self.consumed_count = 0;
        } else {
            let space_remaining = RECEIVE_BUFFER_SIZE - self.receive_buffer_count;
            if space_remaining < MAX_MESSAGE_SIZE {
                self.receive_buffer.copy_within(self.consumed_count.., 0);
                self.receive_buffer_count -= self.consumed_count;
                self.consumed_count = 0;
            }
        }
    }
}
