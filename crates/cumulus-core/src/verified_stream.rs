// Copyright (c) 2025-2026 Cumulus Project
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Integrity-verified byte streams: a CRC-64 accumulator folded over the
// data bytes of a transfer, carried as an 8-byte big-endian trailer after
// the data. Framing the checksum as a stream transform lets verification
// happen incrementally as bytes are consumed, so a corrupted transfer is
// detected before the whole payload is buffered.
use std::future::Future;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use crc::{Crc, Digest, CRC_64_GO_ISO};
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

use crate::error::StreamError;

/// Trailer size in bytes: one big-endian CRC-64 value.
pub const TRAILER_LEN: usize = 8;

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

fn fresh_digest() -> Digest<'static, u64> {
    CRC64.digest()
}

/// How a [`ChecksumReader`] treats the trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// The underlying stream holds only data; the trailer has not been
    /// physically written yet and is synthesized for consumers that
    /// expect it inline. Logical length = data + 8.
    Append,
    /// The underlying stream already carries the 8-byte trailer after the
    /// data. The trailer is routed to verification, never to the caller.
    Verify,
}

enum WriteStage {
    Data,
    Trailer { buf: [u8; TRAILER_LEN], written: usize },
    Closing,
    Done,
}

/// Write-mode transform: forwards every write to the underlying stream
/// while folding it into the checksum; shutdown appends the trailer.
///
/// Shutdown is idempotent — the trailer is written exactly once. With
/// `dispose_inner = false` the underlying stream is flushed but left
/// open (it may be a slice of a longer-lived connection).
pub struct ChecksumWriter<W> {
    inner: W,
    digest: Option<Digest<'static, u64>>,
    stage: WriteStage,
    dispose_inner: bool,
    data_written: u64,
}

impl<W> ChecksumWriter<W> {
    pub fn new(inner: W, dispose_inner: bool) -> Self {
        Self {
            inner,
            digest: Some(fresh_digest()),
            stage: WriteStage::Data,
            dispose_inner,
            data_written: 0,
        }
    }

    /// Data bytes accepted so far (the trailer is not counted).
    pub fn data_written(&self) -> u64 {
        self.data_written
    }

    /// Length a downstream consumer will observe once shut down.
    pub fn logical_len(&self) -> u64 {
        self.data_written + TRAILER_LEN as u64
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for ChecksumWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if !matches!(this.stage, WriteStage::Data) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "write after checksum trailer",
            )));
        }
        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        if let Some(digest) = this.digest.as_mut() {
            digest.update(&buf[..n]);
        }
        this.data_written += n as u64;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.stage {
                WriteStage::Data => {
                    let sum = match this.digest.take() {
                        Some(digest) => digest.finalize(),
                        None => 0,
                    };
                    this.stage = WriteStage::Trailer {
                        buf: sum.to_be_bytes(),
                        written: 0,
                    };
                }
                WriteStage::Trailer { buf, written } => {
                    while *written < TRAILER_LEN {
                        let n =
                            ready!(Pin::new(&mut this.inner).poll_write(cx, &buf[*written..]))?;
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                        }
                        *written += n;
                    }
                    this.stage = WriteStage::Closing;
                }
                WriteStage::Closing => {
                    if this.dispose_inner {
                        ready!(Pin::new(&mut this.inner).poll_shutdown(cx))?;
                    } else {
                        ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
                    }
                    this.stage = WriteStage::Done;
                    return Poll::Ready(Ok(()));
                }
                WriteStage::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

/// Read-mode transform over an underlying stream of declared data length.
///
/// See [`ReadMode`] for the two sub-modes. An optional idle timeout
/// cancels a read whose underlying stream stays pending for too long;
/// the deadline re-arms whenever bytes flow, so active reads are never
/// penalized.
pub struct ChecksumReader<R> {
    inner: R,
    mode: ReadMode,
    data_len: u64,
    consumed: u64,
    digest: Option<Digest<'static, u64>>,
    computed: Option<[u8; TRAILER_LEN]>,
    trailer: [u8; TRAILER_LEN],
    trailer_read: usize,
    trailer_served: usize,
    verified: bool,
    timeout: Option<Duration>,
    deadline: Option<Pin<Box<Sleep>>>,
    pending_noop_seek: bool,
}

impl<R> ChecksumReader<R> {
    pub fn new(inner: R, mode: ReadMode, data_len: u64, timeout: Option<Duration>) -> Self {
        Self {
            inner,
            mode,
            data_len,
            consumed: 0,
            digest: Some(fresh_digest()),
            computed: None,
            trailer: [0u8; TRAILER_LEN],
            trailer_read: 0,
            trailer_served: 0,
            verified: false,
            timeout,
            deadline: None,
            pending_noop_seek: false,
        }
    }

    /// Length visible to the caller: data plus the (real or synthesized)
    /// trailer in append mode, data only in verify mode.
    pub fn logical_len(&self) -> u64 {
        match self.mode {
            ReadMode::Append => self.data_len + TRAILER_LEN as u64,
            ReadMode::Verify => self.data_len,
        }
    }

    fn logical_position(&self) -> u64 {
        match self.mode {
            ReadMode::Append => self.consumed + self.trailer_served as u64,
            ReadMode::Verify => self.consumed,
        }
    }

    /// Release the underlying stream without consuming whatever trails
    /// this slice of it.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn reset(&mut self) {
        self.digest = Some(fresh_digest());
        self.computed = None;
        self.consumed = 0;
        self.trailer = [0u8; TRAILER_LEN];
        self.trailer_read = 0;
        self.trailer_served = 0;
        self.verified = false;
        self.deadline = None;
    }

    fn finalize_checksum(&mut self) -> [u8; TRAILER_LEN] {
        if let Some(sum) = self.computed {
            return sum;
        }
        let sum = match self.digest.take() {
            Some(digest) => digest.finalize(),
            None => 0,
        }
        .to_be_bytes();
        self.computed = Some(sum);
        sum
    }
}

impl<R: AsyncRead + Unpin> ChecksumReader<R> {
    /// Read data bytes into `buf`, capped at the data boundary so an
    /// underlying read that straddles data and trailer never hands
    /// trailer bytes to the caller.
    fn poll_data(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let cap = (self.data_len - self.consumed).min(buf.remaining() as u64) as usize;
        let dst = buf.initialize_unfilled_to(cap);
        let mut limited = ReadBuf::new(dst);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut limited))?;
        let n = limited.filled().len();
        if n == 0 {
            return Poll::Ready(Err(StreamError::Truncated {
                expected: self.data_len,
                actual: self.consumed,
            }
            .into()));
        }
        if let Some(digest) = self.digest.as_mut() {
            digest.update(limited.filled());
        }
        buf.advance(n);
        self.consumed += n as u64;
        if self.consumed == self.data_len {
            self.finalize_checksum();
        }
        Poll::Ready(Ok(()))
    }

    /// Pull the stored trailer out of the underlying stream and compare
    /// it byte-for-byte against the computed checksum.
    fn poll_verify_trailer(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.trailer_read < TRAILER_LEN {
            let before = self.trailer_read;
            let mut trailer_buf = ReadBuf::new(&mut self.trailer[before..]);
            ready!(Pin::new(&mut self.inner).poll_read(cx, &mut trailer_buf))?;
            let n = trailer_buf.filled().len();
            if n == 0 {
                return Poll::Ready(Err(StreamError::Truncated {
                    expected: self.data_len + TRAILER_LEN as u64,
                    actual: self.data_len + before as u64,
                }
                .into()));
            }
            self.trailer_read = before + n;
        }
        let computed = u64::from_be_bytes(self.finalize_checksum());
        let stored = u64::from_be_bytes(self.trailer);
        if computed != stored {
            return Poll::Ready(Err(StreamError::ChecksumMismatch { computed, stored }.into()));
        }
        self.verified = true;
        Poll::Ready(Ok(()))
    }

    fn poll_read_inner(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        if self.consumed < self.data_len {
            return self.poll_data(cx, buf);
        }
        match self.mode {
            ReadMode::Append => {
                let sum = self.finalize_checksum();
                if self.trailer_served >= TRAILER_LEN {
                    return Poll::Ready(Ok(())); // logical EOF
                }
                let n = (TRAILER_LEN - self.trailer_served).min(buf.remaining());
                buf.put_slice(&sum[self.trailer_served..self.trailer_served + n]);
                self.trailer_served += n;
                Poll::Ready(Ok(()))
            }
            ReadMode::Verify => {
                if self.verified {
                    return Poll::Ready(Ok(())); // logical EOF
                }
                self.poll_verify_trailer(cx)
            }
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ChecksumReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_read_inner(cx, buf) {
            Poll::Ready(result) => {
                this.deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if let Some(timeout) = this.timeout {
                    let deadline = this
                        .deadline
                        .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                    if deadline.as_mut().poll(cx).is_ready() {
                        this.deadline = None;
                        return Poll::Ready(Err(StreamError::IdleTimeout(timeout).into()));
                    }
                }
                Poll::Pending
            }
        }
    }
}

/// Seeking supports exactly two shapes: rewind to start (resets the
/// checksum accumulator) and a zero-length relative seek (no-op used by
/// position queries). Everything else is refused.
impl<R: AsyncRead + AsyncSeek + Unpin> AsyncSeek for ChecksumReader<R> {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        match position {
            SeekFrom::Start(0) => {
                this.reset();
                Pin::new(&mut this.inner).start_seek(SeekFrom::Start(0))
            }
            SeekFrom::Current(0) => {
                this.pending_noop_seek = true;
                Ok(())
            }
            _ => Err(StreamError::UnsupportedSeek.into()),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        let this = self.get_mut();
        if this.pending_noop_seek {
            this.pending_noop_seek = false;
            return Poll::Ready(Ok(this.logical_position()));
        }
        ready!(Pin::new(&mut this.inner).poll_complete(cx))?;
        Poll::Ready(Ok(this.logical_position()))
    }
}
