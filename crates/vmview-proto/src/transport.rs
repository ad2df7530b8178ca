//! `SOCK_SEQPACKET` transport with SCM_RIGHTS file descriptor passing.

use crate::{ClientMessage, ProtoError, Result, ServerMessage, MAX_FDS, MAX_MESSAGE_SIZE};
use nix::sys::socket::{
    connect, recvmsg, sendmsg, socket, socketpair, AddressFamily, ControlMessage,
    ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixAddr,
};
use std::collections::VecDeque;
use std::io::{IoSlice, IoSliceMut};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use tracing::{debug, trace, warn};

/// One received datagram with the descriptors that travelled alongside it
#[derive(Debug)]
pub struct Datagram {
    pub data: Vec<u8>,
    pub fds: VecDeque<OwnedFd>,
}

/// One end of a display channel socket
#[derive(Debug)]
pub struct Channel {
    fd: OwnedFd,
}

impl Channel {
    /// Connect to a listening display server
    pub fn connect(path: &Path) -> Result<Self> {
        let fd = socket(
            AddressFamily::Unix,
            SockType::SeqPacket,
            SockFlag::SOCK_CLOEXEC,
            None,
        )?;
        let addr = UnixAddr::new(path)?;
        connect(fd.as_raw_fd(), &addr)?;
        debug!("Connected display channel to {:?}", path);
        Ok(Self { fd })
    }

    /// Create a connected pair of channel ends
    pub fn pair() -> Result<(Self, Self)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        Ok((Self { fd: a }, Self { fd: b }))
    }

    /// Duplicate the socket so reading and writing can live on different threads
    pub fn try_clone(&self) -> std::io::Result<Self> {
        Ok(Self {
            fd: self.fd.try_clone()?,
        })
    }

    /// Send one datagram with optional fds attached
    pub fn send_raw(&self, data: &[u8], fds: &[RawFd]) -> Result<()> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(ProtoError::TooLarge(data.len()));
        }
        let iov = [IoSlice::new(data)];
        let cmsgs = if fds.is_empty() {
            vec![]
        } else {
            vec![ControlMessage::ScmRights(fds)]
        };
        sendmsg::<()>(self.fd.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
        trace!("Sent {} bytes with {} fd(s)", data.len(), fds.len());
        Ok(())
    }

    /// Receive one datagram. Returns `None` once the peer has hung up.
    pub fn recv_raw(&self) -> Result<Option<Datagram>> {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS]);

        let (len, truncated, fds) = {
            let mut iov = [IoSliceMut::new(&mut buf)];
            let msg = recvmsg::<()>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_CMSG_CLOEXEC,
            )?;

            let mut fds = VecDeque::new();
            for cmsg in msg.cmsgs()? {
                if let ControlMessageOwned::ScmRights(raw) = cmsg {
                    // The kernel installed these descriptors in our table; we own them now.
                    fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
                }
            }
            (msg.bytes, msg.flags.contains(MsgFlags::MSG_TRUNC), fds)
        };

        if truncated {
            return Err(ProtoError::DatagramTruncated);
        }
        if len == 0 && fds.is_empty() {
            return Ok(None);
        }

        buf.truncate(len);
        trace!("Received {} bytes with {} fd(s)", len, fds.len());
        Ok(Some(Datagram { data: buf, fds }))
    }

    /// Send a server message (used by display servers and test harnesses)
    pub fn send_server(&self, msg: &ServerMessage) -> Result<()> {
        let (data, fds) = msg.encode();
        self.send_raw(&data, &fds)
    }

    /// Receive and decode the next server message. `None` means hang-up.
    pub fn recv_server(&self) -> Result<Option<ServerMessage>> {
        let Some(Datagram { data, mut fds }) = self.recv_raw()? else {
            return Ok(None);
        };
        let msg = ServerMessage::decode(&data, &mut fds)?;
        if !fds.is_empty() {
            warn!(
                "Dropping {} unexpected fd(s) attached to message kind {}",
                fds.len(),
                msg.kind()
            );
        }
        Ok(Some(msg))
    }

    pub fn send_client(&self, msg: &ClientMessage) -> Result<()> {
        self.send_raw(&msg.encode(), &[])
    }

    pub fn recv_client(&self) -> Result<Option<ClientMessage>> {
        match self.recv_raw()? {
            Some(Datagram { data, .. }) => Ok(Some(ClientMessage::decode(&data)?)),
            None => Ok(None),
        }
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{GlScanoutWire, RectWire, SCANOUT_FLAG_Y0TOP};
    use std::fs::File;
    use std::io::{Read, Write};

    #[test]
    fn test_scanout_fd_crosses_the_socket() {
        let (server, viewer) = Channel::pair().unwrap();
        let (read_end, write_end) = nix::unistd::pipe().unwrap();

        let msg = ServerMessage::GlScanout {
            scanout: GlScanoutWire {
                format: u32::from_le_bytes(*b"XR24"),
                width: 16,
                height: 16,
                stride: 64,
                w: 16,
                h: 16,
                flags: SCANOUT_FLAG_Y0TOP,
                ..Default::default()
            },
            fd: Some(write_end),
        };
        server.send_server(&msg).unwrap();
        drop(msg);

        let received = viewer.recv_server().unwrap().unwrap();
        let ServerMessage::GlScanout { scanout, fd } = received else {
            panic!("expected a scanout message");
        };
        assert_eq!(scanout.width, 16);
        assert_eq!(scanout.flags & SCANOUT_FLAG_Y0TOP, SCANOUT_FLAG_Y0TOP);

        // The received descriptor is a working duplicate of the pipe's write end.
        let mut writer = File::from(fd.unwrap());
        writer.write_all(b"ok").unwrap();
        drop(writer);

        let mut reader = File::from(read_end);
        let mut out = String::new();
        reader.read_to_string(&mut out).unwrap();
        assert_eq!(out, "ok");
    }

    #[test]
    fn test_hangup_is_reported_as_none() {
        let (server, viewer) = Channel::pair().unwrap();
        server
            .send_server(&ServerMessage::Invalidate(RectWire {
                x: 0,
                y: 0,
                w: 1,
                h: 1,
            }))
            .unwrap();
        drop(server);

        assert!(matches!(
            viewer.recv_server().unwrap(),
            Some(ServerMessage::Invalidate(_))
        ));
        assert!(viewer.recv_server().unwrap().is_none());
    }

    #[test]
    fn test_client_messages_flow_back() {
        let (server, viewer) = Channel::pair().unwrap();
        viewer.send_client(&ClientMessage::GlDrawDone).unwrap();
        assert_eq!(
            server.recv_client().unwrap(),
            Some(ClientMessage::GlDrawDone)
        );
    }
}
