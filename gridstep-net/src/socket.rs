//! TCP connection primitive shared by all three channels.

use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};
use crate::msg::MAX_RECORD_LEN;

/// One live TCP connection.
///
/// Reads and writes go through separate stream handles so a blocking
/// receive never holds up a send. Exactly one thread reads (the
/// connection's reception loop); writes may come from any thread and are
/// serialized by the write lock. Closing is idempotent and safe to call
/// from inside the reception loop itself: the first close shuts the socket
/// down, which fails the pending blocking read and lets the reader thread
/// unwind on its own. Owners drop their shared handle after unregistering;
/// nothing ever destroys a link from the link's own thread.
pub struct TcpLink {
    peer: SocketAddr,
    reader: Mutex<TcpStream>,
    writer: Mutex<TcpStream>,
    // unlocked handle so close() can shut the socket down while the reader
    // or writer lock is held by a blocked call
    raw: TcpStream,
    closed: AtomicBool,
}

impl TcpLink {
    pub fn new(stream: TcpStream) -> Result<Arc<Self>> {
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        let raw = stream.try_clone()?;
        Ok(Arc::new(TcpLink {
            peer,
            reader: Mutex::new(stream),
            writer: Mutex::new(writer),
            raw,
            closed: AtomicBool::new(false),
        }))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Writes the whole buffer, closing the link on any send error.
    pub fn send(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::SendFailed("link already closed".to_string()));
        }
        let mut stream = self.writer.lock().unwrap();
        if let Err(e) = stream.write_all(bytes).and_then(|_| stream.flush()) {
            drop(stream);
            self.close();
            return Err(Error::SendFailed(e.to_string()));
        }
        Ok(())
    }

    /// Reads one `[4B total length]`-prefixed record, returning the whole
    /// record including the length field.
    ///
    /// A declared length below `min_len` or above [`MAX_RECORD_LEN`] means
    /// the stream is no longer record-aligned; the caller is expected to
    /// close the link on that error. A zero-byte receive surfaces as
    /// [`Error::PeerClosed`].
    pub fn recv_record(&self, min_len: usize) -> Result<Vec<u8>> {
        let mut stream = self.reader.lock().unwrap();
        let mut len_buf = [0u8; 4];
        read_all(&mut *stream, &mut len_buf)?;
        let declared = BigEndian::read_u32(&len_buf) as usize;
        if declared < min_len || declared > MAX_RECORD_LEN {
            return Err(Error::FrameOutOfBounds(declared));
        }
        let mut buf = vec![0u8; declared];
        buf[0..4].copy_from_slice(&len_buf);
        read_all(&mut *stream, &mut buf[4..])?;
        Ok(buf)
    }

    /// Reads exactly `buf.len()` bytes (length-implicit framing, used for
    /// solver replies).
    pub fn recv_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut stream = self.reader.lock().unwrap();
        read_all(&mut *stream, buf)
    }

    /// Shuts the connection down. Idempotent; every call past the first is
    /// a no-op.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            trace!("closing link to {}", self.peer);
            // a shutdown error only means the peer beat us to it
            if let Err(e) = self.raw.shutdown(Shutdown::Both) {
                if e.kind() != ErrorKind::NotConnected {
                    debug!("shutdown of link to {} failed: {}", self.peer, e);
                }
            }
        }
    }
}

fn read_all(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
    match stream.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => Err(Error::PeerClosed),
        Err(ref e) if e.kind() == ErrorKind::ConnectionReset => Err(Error::PeerClosed),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Connected localhost link pair for crate-internal tests.
#[cfg(test)]
pub(crate) fn loopback_pair() -> (Arc<TcpLink>, Arc<TcpLink>) {
    use std::net::TcpListener;
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || listener.accept().unwrap().0);
    let client = TcpStream::connect(addr).unwrap();
    let server = handle.join().unwrap();
    (TcpLink::new(client).unwrap(), TcpLink::new(server).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn pair() -> (Arc<TcpLink>, Arc<TcpLink>) {
        loopback_pair()
    }

    #[test]
    fn records_cross_the_link_whole() {
        let (a, b) = pair();
        let mut record = vec![0u8; 10];
        BigEndian::write_u32(&mut record[0..4], 10);
        record[4..].copy_from_slice(b"abcdef");
        a.send(&record).unwrap();
        let received = b.recv_record(4).unwrap();
        assert_eq!(received, record);
    }

    #[test]
    fn peer_close_surfaces_as_peer_closed() {
        let (a, b) = pair();
        a.close();
        assert!(matches!(b.recv_record(4).unwrap_err(), Error::PeerClosed));
    }

    #[test]
    fn close_is_idempotent() {
        let (a, _b) = pair();
        a.close();
        a.close();
        assert!(a.is_closed());
        assert!(matches!(a.send(&[0]).unwrap_err(), Error::SendFailed(_)));
    }

    #[test]
    fn undersized_declared_length_is_rejected() {
        let (a, b) = pair();
        let mut record = [0u8; 4];
        BigEndian::write_u32(&mut record, 2);
        a.send(&record).unwrap();
        assert!(matches!(
            b.recv_record(8).unwrap_err(),
            Error::FrameOutOfBounds(2)
        ));
    }

    #[test]
    fn oversized_declared_length_is_rejected() {
        let (a, b) = pair();
        let mut record = [0u8; 4];
        BigEndian::write_u32(&mut record, (MAX_RECORD_LEN + 1) as u32);
        a.send(&record).unwrap();
        assert!(matches!(
            b.recv_record(8).unwrap_err(),
            Error::FrameOutOfBounds(_)
        ));
    }

    #[test]
    fn close_unblocks_a_pending_receive() {
        let (a, b) = pair();
        let b2 = Arc::clone(&b);
        let handle = thread::spawn(move || b2.recv_record(4));
        thread::sleep(std::time::Duration::from_millis(50));
        b.close();
        let _ = a;
        assert!(handle.join().unwrap().is_err());
    }
}
