// Duplex connection over one TCP stream: a reader thread and a writer thread.
//
// - **Reader thread**: calls `read_frame()` in a loop and hands each frame to
//   the `on_frame` callback. Read errors, EOF, and oversized frames all tear
//   the connection down.
// - **Writer thread**: drains a bounded `sync_channel` of pre-framed payload
//   bytes and writes them through a `BufWriter`. The bound gives outbound
//   backpressure: a sender whose queue is full blocks until the writer
//   catches up.
//
// Senders on arbitrary threads only touch the queue, so partial writes can
// never interleave — the writer thread is the sole owner of the write half.
// `close()` is idempotent, and the `on_disconnect` callback fires exactly
// once no matter which side (reader error, writer error, or local close)
// initiates teardown.

use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;

use hexfront_protocol::framing::{read_frame, write_frame};

use crate::error::MessengerError;

/// Cheap handle to a live connection. Cloning shares the same send queue and
/// teardown state.
#[derive(Clone)]
pub struct Connection {
    tx: SyncSender<WriteOp>,
    shared: Arc<Shared>,
}

enum WriteOp {
    Frame(Vec<u8>),
    /// Drain marker: everything queued ahead of it is flushed before the
    /// socket goes down.
    Close,
}

struct Shared {
    stream: TcpStream,
    open: AtomicBool,
    on_disconnect: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Shared {
    /// Close the socket and fire the disconnect callback. Safe to call from
    /// any thread, any number of times; the callback runs once.
    fn teardown(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        self.fire_disconnect();
    }

    fn fire_disconnect(&self) {
        let callback = self.on_disconnect.lock().expect("poisoned").take();
        if let Some(cb) = callback {
            cb();
        }
    }
}

impl Connection {
    /// Take ownership of a connected stream and spawn its reader and writer
    /// threads. `on_frame` runs on the reader thread for every inbound frame;
    /// `on_disconnect` runs exactly once when the connection dies.
    pub fn spawn(
        stream: TcpStream,
        queue_capacity: usize,
        mut on_frame: impl FnMut(Vec<u8>) + Send + 'static,
        on_disconnect: impl FnOnce() + Send + 'static,
    ) -> std::io::Result<Self> {
        let read_stream = stream.try_clone()?;
        let write_stream = stream.try_clone()?;

        let shared = Arc::new(Shared {
            stream,
            open: AtomicBool::new(true),
            on_disconnect: Mutex::new(Some(Box::new(on_disconnect))),
        });

        let (tx, rx) = mpsc::sync_channel::<WriteOp>(queue_capacity);

        let reader_shared = Arc::clone(&shared);
        thread::spawn(move || {
            let mut reader = BufReader::new(read_stream);
            while reader_shared.open.load(Ordering::SeqCst) {
                match read_frame(&mut reader) {
                    Ok(frame) => on_frame(frame),
                    Err(_) => break,
                }
            }
            reader_shared.teardown();
        });

        let writer_shared = Arc::clone(&shared);
        thread::spawn(move || {
            let mut writer = BufWriter::new(write_stream);
            while let Ok(op) = rx.recv() {
                match op {
                    WriteOp::Frame(frame) => {
                        if write_frame(&mut writer, &frame).is_err() {
                            writer_shared.teardown();
                            return;
                        }
                    }
                    WriteOp::Close => break,
                }
            }
            // Graceful close, or every sender is gone: the queue is drained.
            writer_shared.teardown();
        });

        Ok(Self { tx, shared })
    }

    /// Queue pre-framed payload bytes for transmission. Blocks while the
    /// bounded queue is full. Fails if the connection is down.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), MessengerError> {
        if !self.is_open() {
            return Err(MessengerError::ConnectionClosed);
        }
        self.tx
            .send(WriteOp::Frame(frame))
            .map_err(|_| MessengerError::ConnectionClosed)
    }

    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Close the connection. Frames already queued are flushed before the
    /// socket goes down. Idempotent; fires the disconnect callback on the
    /// first call only.
    pub fn close(&self) {
        if self.shared.open.swap(false, Ordering::SeqCst)
            && self.tx.send(WriteOp::Close).is_err()
        {
            // Writer already gone; nothing left to drain.
            let _ = self.shared.stream.shutdown(Shutdown::Both);
        }
        self.shared.fire_disconnect();
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::Receiver;
    use std::time::Duration;

    use super::*;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    fn spawn_collecting(stream: TcpStream) -> (Connection, Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel();
        let conn = Connection::spawn(
            stream,
            16,
            move |frame| {
                let _ = tx.send(frame);
            },
            || {},
        )
        .unwrap();
        (conn, rx)
    }

    #[test]
    fn frames_cross_the_wire_in_order() {
        let (a, b) = tcp_pair();
        let (conn_a, _rx_a) = spawn_collecting(a);
        let (_conn_b, rx_b) = spawn_collecting(b);

        conn_a.send(b"one".to_vec()).unwrap();
        conn_a.send(b"two".to_vec()).unwrap();
        conn_a.send(b"three".to_vec()).unwrap();

        assert_eq!(rx_b.recv_timeout(Duration::from_secs(5)).unwrap(), b"one");
        assert_eq!(rx_b.recv_timeout(Duration::from_secs(5)).unwrap(), b"two");
        assert_eq!(rx_b.recv_timeout(Duration::from_secs(5)).unwrap(), b"three");
    }

    #[test]
    fn send_after_close_fails() {
        let (a, _b) = tcp_pair();
        let (conn, _rx) = spawn_collecting(a);
        conn.close();
        let err = conn.send(b"late".to_vec()).unwrap_err();
        assert!(matches!(err, MessengerError::ConnectionClosed));
    }

    #[test]
    fn close_is_idempotent_and_notifies_once() {
        let (a, _b) = tcp_pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        let conn = Connection::spawn(a, 16, |_| {}, move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        conn.close();
        conn.close();
        conn.close();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!conn.is_open());
    }

    #[test]
    fn peer_close_fires_disconnect() {
        let (a, b) = tcp_pair();
        let (fired_tx, fired_rx) = mpsc::channel();
        let _conn = Connection::spawn(a, 16, |_| {}, move || {
            let _ = fired_tx.send(());
        })
        .unwrap();

        drop(b); // peer goes away, reader sees EOF
        fired_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("disconnect callback should fire");
    }

    #[test]
    fn garbage_frame_tears_connection_down() {
        use std::io::Write;

        let (a, mut b) = tcp_pair();
        let (fired_tx, fired_rx) = mpsc::channel();
        let _conn = Connection::spawn(a, 16, |_| {}, move || {
            let _ = fired_tx.send(());
        })
        .unwrap();

        // A length prefix far beyond MAX_FRAME_SIZE.
        b.write_all(&u32::MAX.to_be_bytes()).unwrap();
        b.flush().unwrap();

        fired_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("oversized frame should kill the connection");
    }
}
