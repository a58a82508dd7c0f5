//! Network Monitoring Abstraction
//!
//! Lets the sync engine decide whether starting network work is worthwhile.

use crate::{error::Result, platform::PlatformSendSync};

/// Network connection type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    /// Cellular/mobile data connection
    Cellular,
    /// WiFi connection
    WiFi,
    /// Ethernet connection
    Ethernet,
    /// Other or unknown connection type
    Other,
}

/// Network connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    /// Connected to network
    Connected,
    /// Not connected to any network
    Disconnected,
    /// Connection status unknown or indeterminate
    Indeterminate,
}

/// Network information
#[derive(Debug, Clone)]
pub struct NetworkInfo {
    pub status: NetworkStatus,
    pub network_type: Option<NetworkType>,
    /// Whether the connection is metered (has data limits/costs)
    pub is_metered: bool,
}

impl NetworkInfo {
    /// Convenience constructor for a connected, unmetered network.
    pub fn connected(network_type: NetworkType) -> Self {
        Self {
            status: NetworkStatus::Connected,
            network_type: Some(network_type),
            is_metered: false,
        }
    }

    /// Convenience constructor for an offline device.
    pub fn disconnected() -> Self {
        Self {
            status: NetworkStatus::Disconnected,
            network_type: None,
            is_metered: false,
        }
    }
}

/// Network monitor trait
///
/// The sync engine consults the monitor before starting deletions and
/// transfers. Work that cannot start stays queued and is picked up by a later
/// `sync()` pass.
///
/// # Platform Support
///
/// - **Desktop**: System network APIs (NetworkManager, SystemConfiguration)
/// - **iOS**: Network framework, Reachability
/// - **Android**: ConnectivityManager
///
/// # Example
///
/// ```ignore
/// use bridge_traits::network::NetworkMonitor;
///
/// async fn can_start(monitor: &dyn NetworkMonitor) -> bool {
///     monitor.is_connected().await
/// }
/// ```
#[cfg_attr(target_arch = "wasm32", async_trait::async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait::async_trait)]
pub trait NetworkMonitor: PlatformSendSync {
    /// Get current network information
    async fn get_network_info(&self) -> Result<NetworkInfo>;

    /// Check if currently connected to any network
    async fn is_connected(&self) -> bool {
        matches!(
            self.get_network_info().await,
            Ok(NetworkInfo {
                status: NetworkStatus::Connected,
                ..
            })
        )
    }

    /// Check if connection is metered
    async fn is_metered(&self) -> bool {
        matches!(
            self.get_network_info().await,
            Ok(NetworkInfo {
                is_metered: true,
                ..
            })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;

    struct FixedMonitor(Option<NetworkInfo>);

    #[async_trait::async_trait]
    impl NetworkMonitor for FixedMonitor {
        async fn get_network_info(&self) -> Result<NetworkInfo> {
            self.0
                .clone()
                .ok_or_else(|| BridgeError::NotAvailable("network info".to_string()))
        }
    }

    #[test]
    fn test_network_info() {
        let info = NetworkInfo::connected(NetworkType::WiFi);

        assert_eq!(info.status, NetworkStatus::Connected);
        assert_eq!(info.network_type, Some(NetworkType::WiFi));
        assert!(!info.is_metered);
    }

    #[tokio::test]
    async fn test_default_is_connected() {
        let online = FixedMonitor(Some(NetworkInfo::connected(NetworkType::Ethernet)));
        let offline = FixedMonitor(Some(NetworkInfo::disconnected()));
        let unknown = FixedMonitor(None);

        assert!(online.is_connected().await);
        assert!(!offline.is_connected().await);
        assert!(!unknown.is_connected().await);
    }
}
