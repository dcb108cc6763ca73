/*
    This file is part of Donet.

    Copyright © 2024 Max Rodriguez <me@maxrdz.com>

    Donet is free software; you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License,
    as published by the Free Software Foundation, either version 3
    of the License, or (at your option) any later version.

    Donet is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public
    License along with Donet. If not, see <https://www.gnu.org/licenses/>.
*/

//! Wire dialects a [`crate::agent::ClientAgent`] can speak to game
//! clients. Most deployments use [`ModernDialect`]; [`LegacyDialect`]
//! exists so a single binary can still serve older Panda3D/OTP
//! clients, chosen per-instance from config rather than compiled in
//! or out — see `ClientAgent::dialect` in `donet_daemon::config`.

use donet_core::datagram::datagram::Datagram;
use donet_core::datagram::iterator::{DatagramIterator, IteratorError};
use donet_core::globals::{DCFileHash, DoId, Zone};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub dc_hash: DCFileHash,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddInterestRequest {
    pub context: u16,
    pub interest_id: u16,
    pub parent: DoId,
    pub zones: Vec<Zone>,
}

/// Parses/encodes the handful of messages whose framing differs
/// between dialects. Everything else in the catalog is shared.
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn parse_hello(&self, dgi: &mut DatagramIterator) -> Result<ClientHello, IteratorError>;

    fn parse_add_interest(&self, dgi: &mut DatagramIterator, multiple: bool) -> Result<AddInterestRequest, IteratorError>;

    fn encode_done_interest_resp(&self, context: u16, interest_id: u16) -> Datagram;
}

/// The dialect this document's message catalog describes.
pub struct ModernDialect;

impl Dialect for ModernDialect {
    fn name(&self) -> &'static str {
        "modern"
    }

    fn parse_hello(&self, dgi: &mut DatagramIterator) -> Result<ClientHello, IteratorError> {
        let dc_hash = dgi.read_u32()?;
        let version = dgi.read_string()?;
        Ok(ClientHello { dc_hash, version })
    }

    fn parse_add_interest(&self, dgi: &mut DatagramIterator, multiple: bool) -> Result<AddInterestRequest, IteratorError> {
        let context = dgi.read_u16()?;
        let interest_id = dgi.read_u16()?;
        let parent = dgi.read_doid()?;
        let zones = if multiple {
            let count = dgi.read_u16()?;
            let mut zones = Vec::with_capacity(count.into());
            for _ in 0..count {
                zones.push(dgi.read_zone()?);
            }
            zones
        } else {
            vec![dgi.read_zone()?]
        };
        Ok(AddInterestRequest { context, interest_id, parent, zones })
    }

    fn encode_done_interest_resp(&self, context: u16, interest_id: u16) -> Datagram {
        let mut dg = Datagram::default();
        dg.add_u16(donet_core::Protocol::ClientDoneInterestResp.into()).unwrap();
        dg.add_u16(context).unwrap();
        dg.add_u16(interest_id).unwrap();
        dg
    }
}

/// The older Panda3D `OTP_CLIENT`/Astron legacy framing: `CLIENT_HELLO`
/// carries the version string before the DC hash, and interest
/// requests are not tagged with a caller-supplied context id.
pub struct LegacyDialect;

impl Dialect for LegacyDialect {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn parse_hello(&self, dgi: &mut DatagramIterator) -> Result<ClientHello, IteratorError> {
        let version = dgi.read_string()?;
        let dc_hash = dgi.read_u32()?;
        Ok(ClientHello { dc_hash, version })
    }

    fn parse_add_interest(&self, dgi: &mut DatagramIterator, multiple: bool) -> Result<AddInterestRequest, IteratorError> {
        let interest_id = dgi.read_u16()?;
        let parent = dgi.read_doid()?;
        let zones = if multiple {
            let count = dgi.read_u16()?;
            let mut zones = Vec::with_capacity(count.into());
            for _ in 0..count {
                zones.push(dgi.read_zone()?);
            }
            zones
        } else {
            vec![dgi.read_zone()?]
        };
        Ok(AddInterestRequest {
            context: 0,
            interest_id,
            parent,
            zones,
        })
    }

    fn encode_done_interest_resp(&self, _context: u16, interest_id: u16) -> Datagram {
        let mut dg = Datagram::default();
        dg.add_u16(donet_core::Protocol::ClientDoneInterestResp.into()).unwrap();
        dg.add_u16(interest_id).unwrap();
        dg
    }
}

pub fn from_config_name(name: Option<&str>) -> Box<dyn Dialect> {
    match name {
        Some("legacy") => Box::new(LegacyDialect),
        _ => Box::new(ModernDialect),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use donet_core::datagram::datagram::Datagram;

    #[test]
    fn modern_and_legacy_hello_disagree_on_field_order() {
        let mut modern_dg = Datagram::default();
        modern_dg.add_u32(0xDEADBEEF).unwrap();
        modern_dg.add_string("1.0.0").unwrap();
        let mut dgi = DatagramIterator::from(modern_dg);
        let hello = ModernDialect.parse_hello(&mut dgi).unwrap();
        assert_eq!(hello.dc_hash, 0xDEADBEEF);
        assert_eq!(hello.version, "1.0.0");

        let mut legacy_dg = Datagram::default();
        legacy_dg.add_string("1.0.0").unwrap();
        legacy_dg.add_u32(0xDEADBEEF).unwrap();
        let mut dgi = DatagramIterator::from(legacy_dg);
        let hello = LegacyDialect.parse_hello(&mut dgi).unwrap();
        assert_eq!(hello.dc_hash, 0xDEADBEEF);
        assert_eq!(hello.version, "1.0.0");
    }

    #[test]
    fn legacy_add_interest_has_no_context() {
        let mut dg = Datagram::default();
        dg.add_u16(7).unwrap();
        dg.add_doid(100).unwrap();
        dg.add_zone(9).unwrap();
        let mut dgi = DatagramIterator::from(dg);

        let req = LegacyDialect.parse_add_interest(&mut dgi, false).unwrap();
        assert_eq!(req.context, 0);
        assert_eq!(req.interest_id, 7);
        assert_eq!(req.parent, 100);
        assert_eq!(req.zones, vec![9]);
    }

    #[test]
    fn from_config_name_defaults_to_modern() {
        assert_eq!(from_config_name(None).name(), "modern");
        assert_eq!(from_config_name(Some("legacy")).name(), "legacy");
        assert_eq!(from_config_name(Some("bogus")).name(), "modern");
    }
}
