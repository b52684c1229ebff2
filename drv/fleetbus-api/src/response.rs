// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Outcome of one addressed protocol exchange.

use bitflags::bitflags;

bitflags! {
    /// Bit set describing the outcome of a protocol call.
    ///
    /// `OK` means a usable response arrived. It excludes the link-level
    /// error bits but may coexist with the device status bits
    /// (`OVERLOAD`/`OVERHEAT`/`BAD_VOLTAGE`/`ALERT`): a servo can answer
    /// correctly while complaining about its own condition. A response
    /// timeout is not an error path of its own; it is reported as `QUIET`.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct ResponseState: u16 {
        /// A correct, usable response was received.
        const OK = 1 << 0;

        // Status reported by the device alongside a valid response.
        const OVERLOAD = 1 << 1;
        const OVERHEAT = 1 << 2;
        const BAD_VOLTAGE = 1 << 3;
        const ALERT = 1 << 4;

        // Exchange-level failures.
        /// No response before the protocol timeout.
        const QUIET = 1 << 5;
        /// Response arrived but its checksum was wrong.
        const BAD_CHECKSUM = 1 << 6;
        /// Device rejected the instruction.
        const DEVICE_BAD_INSTRUCTION = 1 << 7;
        /// Device saw a corrupted request.
        const DEVICE_BAD_CHECKSUM = 1 << 8;
        /// Response length did not match the request.
        const BAD_SIZE = 1 << 9;
        /// Response did not parse as a frame.
        const BAD_PROTOCOL = 1 << 10;
        /// Response came from an unexpected id.
        const BAD_ID = 1 << 11;
    }
}

impl ResponseState {
    const WARNINGS: Self = Self::OVERLOAD
        .union(Self::OVERHEAT)
        .union(Self::BAD_VOLTAGE)
        .union(Self::ALERT);

    const ERRORS: Self = Self::BAD_CHECKSUM
        .union(Self::DEVICE_BAD_INSTRUCTION)
        .union(Self::DEVICE_BAD_CHECKSUM)
        .union(Self::BAD_SIZE)
        .union(Self::BAD_PROTOCOL)
        .union(Self::BAD_ID);

    /// A usable response was received.
    pub fn is_ok(self) -> bool {
        self.contains(Self::OK)
    }

    /// The device did not answer at all.
    pub fn is_quiet(self) -> bool {
        self.contains(Self::QUIET)
    }

    /// Any device status bit is set.
    pub fn is_warning(self) -> bool {
        self.intersects(Self::WARNINGS)
    }

    /// Any exchange-level failure bit other than `QUIET` is set.
    pub fn is_error(self) -> bool {
        self.intersects(Self::ERRORS)
    }
}
