// Copyright © 2024 Nathaniel Hardesty
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the “Software”), to
// deal in the Software without restriction, including without limitation the
// rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
// sell copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
// IN THE SOFTWARE.

//! # SECS-I ON TCP/IP
//!
//! TCP adapters that tunnel the SECS-I byte stream; the circuit discipline
//! is unchanged from the serial case. The connect side dials the remote
//! endpoint and redials after a separation when the link drops; the
//! receiver side binds, accepts, and rebinds. Both merely move bytes
//! between the socket and the circuit queue.

use crate::circuit::{CircuitEvent, Secs1Engine};
use crate::message::{Secs1Message, Secs1MessageBlock};
use crate::Secs1Error;
use secs_core::{
  CommunicateWaitError, CommunicatorConfig, SecsCommunicator, SecsMessage,
};
use secs_ii::Item;
use std::io::Read;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// ## CONNECT-SIDE COMMUNICATOR
///
/// Dials the remote endpoint; on link loss, waits the rebind separation and
/// dials again.
pub struct Secs1OnTcpIpCommunicator {
  engine: Arc<Secs1Engine>,
  address: SocketAddr,
}

/// ## RECEIVER-SIDE COMMUNICATOR
///
/// Binds and accepts; every accepted socket feeds the same circuit, and the
/// listen socket is rebound after a failure.
pub struct Secs1OnTcpIpReceiverCommunicator {
  engine: Arc<Secs1Engine>,
  address: SocketAddr,
}

impl Secs1OnTcpIpCommunicator {
  /// ### NEW CONNECT-SIDE COMMUNICATOR
  pub fn new(
    address: SocketAddr,
    config: CommunicatorConfig,
  ) -> Result<Arc<Self>, Secs1Error> {
    config.validate()?;
    Ok(Arc::new(Secs1OnTcpIpCommunicator {
      engine: Secs1Engine::new(config),
      address,
    }))
  }
}

impl Secs1OnTcpIpReceiverCommunicator {
  /// ### NEW RECEIVER-SIDE COMMUNICATOR
  pub fn new(
    address: SocketAddr,
    config: CommunicatorConfig,
  ) -> Result<Arc<Self>, Secs1Error> {
    config.validate()?;
    Ok(Arc::new(Secs1OnTcpIpReceiverCommunicator {
      engine: Secs1Engine::new(config),
      address,
    }))
  }
}

/// Listener registration shared by both variants.
macro_rules! secs1_listener_api {
  () => {
    /// ### PARAMETER SETTINGS
    pub fn config(&self) -> &CommunicatorConfig {
      self.engine.base.config()
    }

    /// ### ADD RECEIVED-PRIMARY-MESSAGE LISTENER
    pub fn add_primary_msg_listener(
      &self,
      listener: impl Fn(&Secs1Message) + Send + Sync + 'static,
    ) {
      self.engine.base.add_primary_msg_listener(listener);
    }

    /// ### ADD RECEIVED-ALL-MESSAGES LISTENER
    pub fn add_all_msg_listener(
      &self,
      listener: impl Fn(&Secs1Message) + Send + Sync + 'static,
    ) {
      self.engine.base.add_all_msg_listener(listener);
    }

    /// ### ADD SENT-MESSAGE LISTENER
    pub fn add_sent_msg_listener(
      &self,
      listener: impl Fn(&Secs1Message) + Send + Sync + 'static,
    ) {
      self.engine.base.add_sent_msg_listener(listener);
    }

    /// ### ADD COMMUNICATE LISTENER
    pub fn add_communicate_listener(&self, listener: impl Fn(bool) + Send + Sync + 'static) {
      self.engine.base.add_communicate_listener(listener);
    }

    /// ### ADD ERROR LISTENER
    pub fn add_error_listener(
      &self,
      listener: impl Fn(&(dyn std::error::Error + Send + Sync)) + Send + Sync + 'static,
    ) {
      self.engine.base.add_error_listener(listener);
    }

    /// ### ADD RECEIVED-BLOCK LISTENER
    pub fn add_recv_block_listener(
      &self,
      listener: impl Fn(&Secs1MessageBlock) + Send + Sync + 'static,
    ) {
      self.engine.add_recv_block_listener(Arc::new(listener));
    }

    /// ### ADD TRY-SEND-BLOCK LISTENER
    pub fn add_try_send_block_listener(
      &self,
      listener: impl Fn(&Secs1MessageBlock) + Send + Sync + 'static,
    ) {
      self.engine.add_try_send_block_listener(Arc::new(listener));
    }

    /// ### ADD SENT-BLOCK LISTENER
    pub fn add_sent_block_listener(
      &self,
      listener: impl Fn(&Secs1MessageBlock) + Send + Sync + 'static,
    ) {
      self.engine.add_sent_block_listener(Arc::new(listener));
    }

    /// ### ADD CIRCUIT-EVENT LISTENER
    pub fn add_circuit_event_listener(
      &self,
      listener: impl Fn(&CircuitEvent) + Send + Sync + 'static,
    ) {
      self.engine.add_circuit_event_listener(Arc::new(listener));
    }
  };
}

impl Secs1OnTcpIpCommunicator {
  secs1_listener_api!();
}

impl Secs1OnTcpIpReceiverCommunicator {
  secs1_listener_api!();
}

/// The façade implementation shared by both variants; only the open-loop
/// differs.
macro_rules! secs1_facade {
  ($ty:ty, $spawn:ident) => {
    impl SecsCommunicator for $ty {
      type Message = Secs1Message;
      type Error = Secs1Error;

      fn open(&self) -> Result<(), Secs1Error> {
        match self.engine.base.begin_open() {
          Ok(true) => {
            self.engine.start_circuit();
            let engine = self.engine.clone();
            let address = self.address;
            thread::spawn(move || $spawn(engine, address));
            Ok(())
          }
          Ok(false) => Ok(()),
          Err(_) => Err(Secs1Error::AlreadyClosed),
        }
      }

      fn close(&self) -> Result<(), Secs1Error> {
        if !self.engine.base.begin_close() {
          return Ok(());
        }
        self.engine.shutdown();
        Ok(())
      }

      fn open_and_wait_until_communicating(
        &self,
        timeout: Option<Duration>,
      ) -> Result<(), Secs1Error> {
        self.open()?;
        self
          .engine
          .base
          .wait_until_communicating(timeout)
          .map_err(|error| match error {
            CommunicateWaitError::Closed => Secs1Error::AlreadyClosed,
            CommunicateWaitError::Timeout => Secs1Error::WaitCommunicatingTimeout,
          })
      }

      fn is_communicating(&self) -> bool {
        self.engine.base.is_communicating()
      }

      fn is_equip(&self) -> bool {
        self.engine.base.config().is_equip
      }

      fn send(
        &self,
        stream: u8,
        function: u8,
        w_bit: bool,
        body: Option<Item>,
      ) -> Result<Option<Secs1Message>, Secs1Error> {
        let config = self.engine.base.config();
        let message = Secs1Message::new(
          stream,
          function,
          w_bit,
          body,
          self.engine.base.create_system_bytes(),
          config.device_id,
          config.is_equip,
        )?;
        self.engine.send_secs1_msg(message)
      }

      fn reply(
        &self,
        primary: &Secs1Message,
        stream: u8,
        function: u8,
        w_bit: bool,
        body: Option<Item>,
      ) -> Result<(), Secs1Error> {
        let config = self.engine.base.config();
        let message = Secs1Message::new(
          stream,
          function,
          w_bit,
          body,
          primary.system_bytes(),
          config.device_id,
          config.is_equip,
        )?;
        self.engine.send_secs1_msg(message)?;
        Ok(())
      }
    }
  };
}

secs1_facade!(Secs1OnTcpIpCommunicator, run_connect_loop);
secs1_facade!(Secs1OnTcpIpReceiverCommunicator, run_accept_loop);

/// Dial, pump bytes until the link drops, wait the separation, dial again;
/// until close.
fn run_connect_loop(engine: Arc<Secs1Engine>, address: SocketAddr) {
  let separation = engine.base.config().timeout_rebind;
  while !engine.base.is_closed() {
    match TcpStream::connect_timeout(&address, separation) {
      Ok(socket) => {
        tracing::debug!(%address, "secs-i tcp connected");
        serve_socket(&engine, socket);
      }
      Err(error) => {
        tracing::debug!(%address, error = %error, "secs-i connect attempt failed");
      }
    }
    if engine.base.is_closed() {
      break;
    }
    engine.base.wait_closed(separation);
  }
  tracing::debug!("secs-i connect loop exited");
}

/// Bind, accept until the listener fails, wait the separation, bind again;
/// until close.
fn run_accept_loop(engine: Arc<Secs1Engine>, address: SocketAddr) {
  let separation = engine.base.config().timeout_rebind;
  while !engine.base.is_closed() {
    bind_and_accept(&engine, address);
    if engine.base.is_closed() {
      break;
    }
    engine.base.wait_closed(separation);
  }
  tracing::debug!("secs-i accept loop exited");
}

fn bind_and_accept(engine: &Arc<Secs1Engine>, address: SocketAddr) {
  let listener = match TcpListener::bind(address) {
    Ok(listener) => listener,
    Err(error) => {
      tracing::debug!(%address, error = %error, "secs-i bind failed");
      return;
    }
  };
  if listener.set_nonblocking(true).is_err() {
    return;
  }
  tracing::info!(%address, "secs-i listening");

  loop {
    if engine.base.is_closed() {
      return;
    }
    match listener.accept() {
      Ok((socket, peer)) => {
        tracing::debug!(%peer, "secs-i accepted");
        if socket.set_nonblocking(false).is_err() {
          continue;
        }
        let engine = engine.clone();
        thread::spawn(move || serve_socket(&engine, socket));
      }
      Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
        thread::sleep(ACCEPT_POLL);
      }
      Err(error) => {
        if !engine.base.is_closed() {
          engine.base.put_error(Secs1Error::Io(error));
        }
        return;
      }
    }
  }
}

/// Registers the socket with the engine and pumps inbound bytes into the
/// circuit queue until EOF, a read failure, or close.
fn serve_socket(engine: &Arc<Secs1Engine>, socket: TcpStream) {
  let _ = socket.set_nodelay(true);
  let writer = match socket.try_clone() {
    Ok(writer) => writer,
    Err(error) => {
      engine.base.put_error(Secs1Error::Io(error));
      return;
    }
  };
  let id = engine.add_socket(writer);

  let mut reader = socket;
  let mut buf = [0u8; 4096];
  loop {
    if engine.base.is_closed() {
      break;
    }
    match reader.read(&mut buf) {
      Ok(0) => {
        tracing::debug!("secs-i socket closed by peer");
        break;
      }
      Ok(n) => engine.put_recv_bytes(&buf[..n]),
      Err(error) => {
        if !engine.base.is_closed() {
          engine.base.put_error(Secs1Error::Io(error));
        }
        break;
      }
    }
  }

  engine.remove_socket(id);
  let _ = reader.shutdown(Shutdown::Both);
}
