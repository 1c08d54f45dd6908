// SPDX-License-Identifier: MIT
// Copyright (c) 2026 ADNT Sarl <info@adnt.io>

//! In-process transport to the emulated bootloader.
//!
//! Every request goes through the same byte-level path as on the bus:
//! the command is encoded into a frame, handed to the engine, and the
//! reply bytes are decoded again.

use anyhow::{anyhow, bail, Result};

use busboot_common::protocol::{Command, Response, UdpState};
use busboot_common::{EngineConfig, ProtocolEngine};

use crate::device::{EmulatedDevice, EmulatedLink};

/// Connection to the emulated bootloader.
pub struct Transport {
    engine: ProtocolEngine<EmulatedDevice, EmulatedLink>,
}

impl Transport {
    /// Attach to a device; the emulated bootloader always has debug commands enabled.
    pub fn new(device: EmulatedDevice) -> Self {
        let link = EmulatedLink {
            statistic: device.statistic,
            ..Default::default()
        };
        let config = EngineConfig {
            debug: true,
            ..Default::default()
        };
        Self {
            engine: ProtocolEngine::new(device.layout, config, device, link),
        }
    }

    /// Send a command and decode the reply.
    pub fn send_recv(&mut self, cmd: &Command) -> Result<Response> {
        let frame = cmd
            .encode()
            .map_err(|e| anyhow!("Failed to encode {:?}: {}", cmd.code(), e))?;
        log::trace!("-> {:02x?}", &frame[..]);

        let reply = self.engine.process(&frame);
        log::trace!("<- {:02x?}", &reply[..]);

        Response::decode(&reply).ok_or_else(|| anyhow!("Malformed reply: {:02x?}", &reply[..]))
    }

    /// Read the last-error register.
    pub fn last_error(&mut self) -> Result<UdpState> {
        match self.send_recv(&Command::SendLastError)? {
            Response::LastError(state) => Ok(state),
            response => bail!("Unexpected response to SendLastError: {:?}", response),
        }
    }

    /// Send a state-changing command and check its outcome in the last-error register.
    pub fn execute(&mut self, cmd: &Command) -> Result<()> {
        match self.send_recv(cmd)? {
            Response::Ack => {}
            Response::LastError(state) => bail!("{:?} failed: {}", cmd.code(), state),
            response => bail!("Unexpected response to {:?}: {:?}", cmd.code(), response),
        }
        match self.last_error()? {
            UdpState::Success => Ok(()),
            state => bail!("{:?} failed: {}", cmd.code(), state),
        }
    }

    /// Hold the programming button for the next request.
    pub fn press_programming_button(&mut self) {
        self.engine.link_mut().button_pressed = true;
    }

    pub fn release_programming_button(&mut self) {
        self.engine.link_mut().button_pressed = false;
    }

    /// Flash ranges requested with `DumpFlash` so far.
    pub fn dumps(&self) -> &[(u32, u32)] {
        &self.engine.link().dumps
    }

    pub fn device(&self) -> &EmulatedDevice {
        self.engine.iap()
    }

    /// Detach and hand back the device, keeping the link statistic.
    pub fn into_device(self) -> EmulatedDevice {
        let (mut device, link) = self.engine.into_parts();
        device.statistic = link.statistic;
        device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use busboot_common::FlashLayout;

    fn transport() -> Transport {
        Transport::new(EmulatedDevice::new(FlashLayout::LPC11XX_64K, [0x11; 16]))
    }

    #[test]
    fn test_locked_device_rejects_erase() {
        let mut transport = transport();
        let err = transport.execute(&Command::EraseCompleteFlash).unwrap_err();
        assert!(err.to_string().contains("locked"), "{}", err);
    }

    #[test]
    fn test_unlock_then_erase() {
        let mut transport = transport();
        transport.press_programming_button();
        let uid = match transport.send_recv(&Command::RequestUid).unwrap() {
            Response::Uid(uid) => uid,
            other => panic!("unexpected {:?}", other),
        };
        transport.execute(&Command::UnlockDevice { uid }).unwrap();
        transport.execute(&Command::EraseCompleteFlash).unwrap();
        assert_eq!(transport.last_error().unwrap(), UdpState::Success);
    }

    #[test]
    fn test_statistic_survives_detach() {
        let mut device = EmulatedDevice::new(FlashLayout::LPC11XX_64K, [0; 16]);
        device.statistic.disconnect_count = 3;
        let device = Transport::new(device).into_device();
        assert_eq!(device.statistic.disconnect_count, 3);
    }
}
