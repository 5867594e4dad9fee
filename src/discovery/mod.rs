//! Service advertisement: publishing our presence and learning about peers
//!
//! The advertisement transport is abstracted behind [`ServiceDirectory`]
//! (the publishing half) plus a stream of [`DirectoryEvent`]s (the browsing
//! half). Records travel as flat key/value maps, like DNS-SD TXT records.

pub mod local;
pub mod udp;

use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::error::DiscoveryError;
use crate::protocol::{DeviceIdentity, DeviceType};

pub use local::{LocalDirectory, LocalHub};
pub use udp::BeaconDirectory;

/// Key/value metadata of an advertisement
pub type TxtRecord = BTreeMap<String, String>;

/// What a device advertises about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
    pub device_id: String,
    pub device_type: DeviceType,
    pub device_name: String,
    /// Session listener port
    pub port: u16,
    /// Most preferred first
    pub addresses: Vec<IpAddr>,
    /// Strictly increasing across republications
    pub version: u64,
}

impl ServiceRecord {
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity::new(&self.device_id, self.device_type, &self.device_name)
    }

    pub fn to_txt(&self) -> TxtRecord {
        let addresses: Vec<String> = self.addresses.iter().map(IpAddr::to_string).collect();
        let mut txt = TxtRecord::new();
        txt.insert("deviceId".into(), self.device_id.clone());
        txt.insert("deviceType".into(), self.device_type.to_string());
        txt.insert("deviceName".into(), self.device_name.clone());
        txt.insert("port".into(), self.port.to_string());
        txt.insert("addresses".into(), addresses.join(","));
        txt.insert("version".into(), self.version.to_string());
        txt
    }

    /// Parse a discovered record. Unparseable addresses are skipped; every
    /// other field is required.
    pub fn from_txt(txt: &TxtRecord) -> Result<Self, DiscoveryError> {
        fn required<'a>(txt: &'a TxtRecord, field: &'static str) -> Result<&'a str, DiscoveryError> {
            txt.get(field)
                .map(String::as_str)
                .filter(|v| !v.is_empty())
                .ok_or(DiscoveryError::MissingField(field))
        }
        fn invalid(field: &'static str, value: &str) -> DiscoveryError {
            DiscoveryError::InvalidField {
                field,
                value: value.to_string(),
            }
        }

        let device_id = required(txt, "deviceId")?;
        let device_type = required(txt, "deviceType")?;
        let device_name = required(txt, "deviceName")?;
        let port = required(txt, "port")?;
        let version = required(txt, "version")?;

        let addresses = txt
            .get("addresses")
            .map(|list| {
                list.split(',')
                    .filter(|s| !s.is_empty())
                    .filter_map(|s| s.trim().parse::<IpAddr>().ok())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            device_id: device_id.to_string(),
            device_type: device_type.parse().map_err(|_| invalid("deviceType", device_type))?,
            device_name: device_name.to_string(),
            port: port.parse().map_err(|_| invalid("port", port))?,
            addresses,
            version: version.parse().map_err(|_| invalid("version", version))?,
        })
    }
}

/// How an `Up` event was learned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// A service advertisement; the coordinator answers with unicast identities
    Advertisement,
    /// A direct identity beacon; never answered, to avoid echo loops
    Beacon,
}

/// Browse results delivered to the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    Up { txt: TxtRecord, origin: Origin },
    Down { device_id: String },
}

/// Publishing half of a service directory
pub trait ServiceDirectory: Send {
    /// Replace the current advertisement
    fn publish(&mut self, record: &ServiceRecord);

    /// Withdraw the current advertisement
    fn unpublish(&mut self);

    /// Send our identity straight to one address, if the transport can
    fn announce_to(&mut self, _target: IpAddr) {}

    fn stop(&mut self) {
        self.unpublish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> ServiceRecord {
        ServiceRecord {
            device_id: "abc".into(),
            device_type: DeviceType::Main,
            device_name: "Stage Left".into(),
            port: 41000,
            addresses: vec!["192.168.1.4".parse().unwrap(), "10.0.0.4".parse().unwrap()],
            version: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_txt_layout() {
        let txt = record().to_txt();
        assert_eq!(txt["addresses"], "192.168.1.4,10.0.0.4");
        assert_eq!(txt["version"], "1700000000000");
        assert_eq!(txt["deviceType"], "main");
        assert_eq!(ServiceRecord::from_txt(&txt).unwrap(), record());
    }

    #[test]
    fn test_missing_or_invalid_fields() {
        let mut txt = record().to_txt();
        txt.remove("version");
        assert_eq!(ServiceRecord::from_txt(&txt), Err(DiscoveryError::MissingField("version")));

        let mut txt = record().to_txt();
        txt.insert("deviceType".into(), "tablet".into());
        assert!(matches!(
            ServiceRecord::from_txt(&txt),
            Err(DiscoveryError::InvalidField { field: "deviceType", .. })
        ));

        let mut txt = record().to_txt();
        txt.insert("addresses".into(), "10.0.0.9,,bogus".into());
        assert_eq!(
            ServiceRecord::from_txt(&txt).unwrap().addresses,
            vec!["10.0.0.9".parse::<IpAddr>().unwrap()]
        );
    }
}
