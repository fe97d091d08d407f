use serde::{Deserialize, Serialize};

/// One entry of the supplied ICE server list. Matches the JSON shape the
/// application hands to the browser (`urls`, optional credentials).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub credential: String,
}

/// Which side of the signaling link generates the initial offer.
///
/// Source deployments diverge here, so it is a topology knob rather than a
/// fixed direction: the state machine supports either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfferSide {
    /// This session creates and emits the offer (browser-hook topology).
    #[default]
    Local,
    /// The remote end offers; this session answers.
    Remote,
}

/// Configuration for one voice session.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    /// ICE servers for connection establishment. Consumed as supplied; this
    /// crate never operates STUN/TURN itself.
    pub ice_servers: Vec<IceServer>,
    /// Offer topology for this session.
    pub offer_side: OfferSide,
    /// Automatic ICE restarts attempted before a failure is terminal.
    pub restart_limit: u8,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_string()],
                username: String::new(),
                credential: String::new(),
            }],
            offer_side: OfferSide::Local,
            restart_limit: 1,
        }
    }
}

impl VoiceConfig {
    pub fn builder() -> VoiceConfigBuilder {
        VoiceConfigBuilder::default()
    }

    /// Configuration with no ICE servers, for loopback and in-process tests.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ..Default::default()
        }
    }
}

#[derive(Default)]
pub struct VoiceConfigBuilder {
    ice_servers: Vec<IceServer>,
    offer_side: Option<OfferSide>,
    restart_limit: Option<u8>,
}

impl VoiceConfigBuilder {
    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            username: String::new(),
            credential: String::new(),
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(IceServer {
            urls,
            username,
            credential,
        });
        self
    }

    pub fn offer_side(mut self, side: OfferSide) -> Self {
        self.offer_side = Some(side);
        self
    }

    pub fn restart_limit(mut self, limit: u8) -> Self {
        self.restart_limit = Some(limit);
        self
    }

    pub fn build(self) -> VoiceConfig {
        let defaults = VoiceConfig::default();
        VoiceConfig {
            ice_servers: if self.ice_servers.is_empty() {
                defaults.ice_servers
            } else {
                self.ice_servers
            },
            offer_side: self.offer_side.unwrap_or(defaults.offer_side),
            restart_limit: self.restart_limit.unwrap_or(defaults.restart_limit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_keeps_supplied_servers_and_topology() {
        let config = VoiceConfig::builder()
            .add_ice_server_with_credentials(
                vec!["turn:turn.example.net:3478".into()],
                "user".into(),
                "secret".into(),
            )
            .offer_side(OfferSide::Remote)
            .build();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.ice_servers[0].username, "user");
        assert_eq!(config.offer_side, OfferSide::Remote);
        assert_eq!(config.restart_limit, 1);
    }

    #[test]
    fn ice_servers_deserialize_from_supplied_list() {
        let json = r#"[{"urls": ["stun:stun.example.net:3478"]}]"#;
        let servers: Vec<IceServer> = serde_json::from_str(json).expect("deserialize");
        assert_eq!(servers[0].urls[0], "stun:stun.example.net:3478");
        assert!(servers[0].username.is_empty());
    }
}
