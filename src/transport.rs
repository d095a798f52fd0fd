// SPDX-FileCopyrightText: Copyright (c) 2017-2024 slowtec GmbH <post@slowtec.de>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Direction-switching serial transport.
//!
//! [`RtsTransport`] wraps the serial stream handed to the RTU client and
//! takes the role of the custom RTS hook: the client writes a request
//! frame and flushes it before awaiting the response, so committing
//! transmit mode on the first written byte and receive mode once the flush
//! completes places the direction switches exactly at the frame
//! boundaries. Both commits run synchronously inside the poll functions;
//! they are single `write(2)` calls that complete in microseconds.

use std::{
    io,
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{ready, Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    direction::{Direction, DirectionSwitch},
    Error,
};

/// Shared slot for a fatal direction-switch failure.
///
/// The protocol client has no channel for typed errors from inside the
/// transport, so the transport parks the typed error here and hands the
/// client a plain [`io::Error`]. The session checks the latch after a
/// failed call and reports the parked fatal error instead of a generic
/// transaction failure.
#[derive(Debug, Clone, Default)]
pub struct FaultLatch(Arc<Mutex<Option<Error>>>);

impl FaultLatch {
    /// Takes the parked error, leaving the latch empty.
    pub fn take(&self) -> Option<Error> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Parks `err` (keeping the first one) and returns a mirroring
    /// [`io::Error`] for the protocol client.
    fn park(&self, err: Error) -> io::Error {
        let message = err.to_string();
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
        io::Error::new(io::ErrorKind::Other, message)
    }
}

/// A serial transport that commits the transceiver direction around every
/// request/response cycle.
#[derive(Debug)]
pub struct RtsTransport<T, D> {
    inner: T,
    switch: D,
    direction: Direction,
    faults: FaultLatch,
}

impl<T, D> RtsTransport<T, D>
where
    D: DirectionSwitch,
{
    /// Wraps `inner`, starting out in receive direction.
    pub fn new(inner: T, switch: D) -> Self {
        Self {
            inner,
            switch,
            direction: Direction::Receive,
            faults: FaultLatch::default(),
        }
    }

    /// A handle to the latch that captures fatal switch failures.
    pub fn fault_latch(&self) -> FaultLatch {
        self.faults.clone()
    }

    /// Commits `direction`, blocking until the line state is applied.
    fn commit(&mut self, direction: Direction) -> io::Result<()> {
        self.switch
            .set_transmit(direction == Direction::Transmit)
            .map_err(|err| self.faults.park(err))?;
        self.direction = direction;
        Ok(())
    }
}

impl<T, D> AsyncRead for RtsTransport<T, D>
where
    T: AsyncRead + Unpin,
    D: DirectionSwitch + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // A caller that reads without flushing first must not leave the
        // driver on the bus while listening.
        if this.direction == Direction::Transmit {
            this.commit(Direction::Receive)?;
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<T, D> AsyncWrite for RtsTransport<T, D>
where
    T: AsyncWrite + Unpin,
    D: DirectionSwitch + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.direction == Direction::Receive {
            this.commit(Direction::Transmit)?;
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
        // The request frame is on the wire; re-enable the receiver before
        // the response can arrive.
        if this.direction == Direction::Transmit {
            this.commit(Direction::Receive)?;
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_shutdown(cx))?;
        if this.direction == Direction::Transmit {
            this.commit(Direction::Receive)?;
        }
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Switch(bool),
        Write(usize),
        Read(usize),
    }

    type EventLog = Arc<Mutex<Vec<Event>>>;

    fn record(log: &EventLog, event: Event) {
        log.lock().unwrap().push(event);
    }

    #[derive(Debug)]
    struct RecordingSwitch {
        log: EventLog,
        fail: bool,
    }

    impl DirectionSwitch for RecordingSwitch {
        fn set_transmit(&mut self, enable: bool) -> crate::Result<()> {
            if self.fail {
                return Err(Error::Io {
                    pin: 272,
                    source: io::Error::new(ErrorKind::WriteZero, "short write"),
                });
            }
            record(&self.log, Event::Switch(enable));
            Ok(())
        }
    }

    /// Records successful reads/writes of the wrapped stream into the
    /// shared event log so their ordering relative to the direction
    /// switches can be asserted.
    #[derive(Debug)]
    struct SpyStream<T> {
        inner: T,
        log: EventLog,
    }

    impl<T: AsyncRead + Unpin> AsyncRead for SpyStream<T> {
        fn poll_read(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            let before = buf.filled().len();
            ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
            record(&this.log, Event::Read(buf.filled().len() - before));
            Poll::Ready(Ok(()))
        }
    }

    impl<T: AsyncWrite + Unpin> AsyncWrite for SpyStream<T> {
        fn poll_write(
            self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let this = self.get_mut();
            let written = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
            record(&this.log, Event::Write(written));
            Poll::Ready(Ok(written))
        }

        fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_flush(cx)
        }

        fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
        }
    }

    fn transport_with_log(
        fail: bool,
    ) -> (
        RtsTransport<SpyStream<tokio::io::DuplexStream>, RecordingSwitch>,
        tokio::io::DuplexStream,
        EventLog,
    ) {
        let (near, far) = tokio::io::duplex(64);
        let log = EventLog::default();
        let transport = RtsTransport::new(
            SpyStream {
                inner: near,
                log: Arc::clone(&log),
            },
            RecordingSwitch {
                log: Arc::clone(&log),
                fail,
            },
        );
        (transport, far, log)
    }

    #[tokio::test]
    async fn switches_direction_around_one_transaction() {
        let (mut transport, mut device, log) = transport_with_log(false);

        transport.write_all(b"request").await.unwrap();
        transport.flush().await.unwrap();

        device.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        transport.read_exact(&mut buf).await.unwrap();

        let events = log.lock().unwrap().clone();
        let switches: Vec<_> = events
            .iter()
            .filter_map(|event| match event {
                Event::Switch(enable) => Some(*enable),
                _ => None,
            })
            .collect();
        assert_eq!(switches, [true, false]);

        // Transmit before the first written byte, receive after the flush
        // and before the first read byte.
        let first_write = events
            .iter()
            .position(|e| matches!(e, Event::Write(_)))
            .unwrap();
        let first_read = events
            .iter()
            .position(|e| matches!(e, Event::Read(_)))
            .unwrap();
        let tx = events.iter().position(|e| *e == Event::Switch(true)).unwrap();
        let rx = events
            .iter()
            .position(|e| *e == Event::Switch(false))
            .unwrap();
        assert!(tx < first_write);
        assert!(first_write < rx);
        assert!(rx < first_read);
    }

    #[tokio::test]
    async fn reading_without_flush_reenables_the_receiver() {
        let (mut transport, mut device, log) = transport_with_log(false);

        transport.write_all(b"request").await.unwrap();
        device.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        transport.read_exact(&mut buf).await.unwrap();

        let events = log.lock().unwrap().clone();
        let rx = events
            .iter()
            .position(|e| *e == Event::Switch(false))
            .unwrap();
        let first_read = events
            .iter()
            .position(|e| matches!(e, Event::Read(_)))
            .unwrap();
        assert!(rx < first_read);
    }

    #[tokio::test]
    async fn idle_flush_does_not_touch_the_lines() {
        let (mut transport, _device, log) = transport_with_log(false);

        transport.flush().await.unwrap();

        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn switch_failure_aborts_the_write_and_is_latched() {
        let (mut transport, _device, log) = transport_with_log(true);
        let faults = transport.fault_latch();

        let result = transport.write_all(b"request").await;

        assert!(result.is_err());
        assert!(matches!(faults.take(), Some(Error::Io { pin: 272, .. })));
        // Nothing reached the wire.
        assert!(log.lock().unwrap().is_empty());
    }
}
