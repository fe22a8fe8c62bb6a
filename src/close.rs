// This code is sourced primarily from the tungstenite-rs library, which can be found at:
// https://github.com/snapview/tungstenite-rs/blob/42b8797e8b7f39efb7d9322dc8af3e9089db4f7d/src/protocol/frame/coding.rs#L117
//
// Original contributions by:
// Copyright (c) 2017 Alexey Galakhov
// Copyright (c) 2016 Jason Housley
// Licensed under both MIT and Apache 2.0 licenses
//
// Licensed under the Apache License, Version 2.0 (the "License");
// You may obtain a copy of the License at:
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is provided "AS IS", WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND,
// either express or implied. See the License for specific language governing permissions and limitations.
//

use self::CloseCode::*;

/// Status codes carried in the payload of a Close frame, per
/// [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CloseCode {
    /// Indicates a normal closure (1000): the purpose for which the
    /// connection was established has been fulfilled.
    Normal,
    /// Indicates that an endpoint is going away (1001), such as a server
    /// shutting down or a browser navigating away from the page.
    Away,
    /// Indicates that an endpoint is terminating the connection due to a
    /// protocol error (1002).
    Protocol,
    /// Indicates that an endpoint received a type of data it cannot
    /// accept (1003).
    Unsupported,
    /// Indicates that no status code was present in the Close frame
    /// (1005). Never sent on the wire.
    Status,
    /// Indicates that the connection was dropped without a close
    /// handshake (1006). Never sent on the wire.
    Abnormal,
    /// Indicates that an endpoint received message data inconsistent with
    /// its type (1007), such as non-UTF-8 data in a text message.
    Invalid,
    /// Indicates that an endpoint received a message violating its policy
    /// (1008), when no more specific code applies.
    Policy,
    /// Indicates that an endpoint received a message too big for it to
    /// process (1009).
    Size,
    /// Indicates that the client expected the server to negotiate an
    /// extension it did not (1010).
    Extension,
    /// Indicates that the server encountered an unexpected condition that
    /// prevented it from fulfilling the request (1011).
    Error,
    /// Indicates that the server is restarting (1012).
    Restart,
    /// Indicates that the server is overloaded and the client should
    /// retry later (1013).
    Again,
    #[doc(hidden)]
    /// Indicates a TLS handshake failure (1015). Never sent on the wire.
    Tls,
    #[doc(hidden)]
    /// Reserved status codes.
    Reserved(u16),
    #[doc(hidden)]
    /// IANA-registered codes (3000-3999).
    Iana(u16),
    #[doc(hidden)]
    /// Application-defined codes (4000-4999).
    Library(u16),
    #[doc(hidden)]
    /// Codes outside the acceptable ranges.
    Bad(u16),
}

impl CloseCode {
    /// Whether this code may legally appear in a Close frame payload.
    pub fn is_allowed(self) -> bool {
        !matches!(self, Bad(_) | Reserved(_) | Status | Abnormal | Tls)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => Normal,
            1001 => Away,
            1002 => Protocol,
            1003 => Unsupported,
            1005 => Status,
            1006 => Abnormal,
            1007 => Invalid,
            1008 => Policy,
            1009 => Size,
            1010 => Extension,
            1011 => Error,
            1012 => Restart,
            1013 => Again,
            1015 => Tls,
            1..=999 => Bad(code),
            1016..=2999 => Reserved(code),
            3000..=3999 => Iana(code),
            4000..=4999 => Library(code),
            _ => Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            Normal => 1000,
            Away => 1001,
            Protocol => 1002,
            Unsupported => 1003,
            Status => 1005,
            Abnormal => 1006,
            Invalid => 1007,
            Policy => 1008,
            Size => 1009,
            Extension => 1010,
            Error => 1011,
            Restart => 1012,
            Again => 1013,
            Tls => 1015,
            Reserved(code) => code,
            Iana(code) => code,
            Library(code) => code,
            Bad(code) => code,
        }
    }
}
