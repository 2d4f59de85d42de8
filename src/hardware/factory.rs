use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::Sources;
use crate::config::SiteConfig;

/// Where the dashboard's data comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    /// One simulated site standing in for every collaborator
    Simulated,
    /// No collaborators; the dashboard idles with empty tiles
    Offline,
}

impl Default for HardwareMode {
    fn default() -> Self {
        HardwareMode::Simulated
    }
}

/// Builds the collaborator set for the configured mode
pub struct SourceFactory {
    mode: HardwareMode,
    site: SiteConfig,
}

impl SourceFactory {
    pub fn new(mode: HardwareMode, site: SiteConfig) -> Self {
        Self { mode, site }
    }

    pub fn build(&self) -> Sources {
        match self.mode {
            #[cfg(feature = "sim")]
            HardwareMode::Simulated => self.simulated(),
            #[cfg(not(feature = "sim"))]
            HardwareMode::Simulated => {
                tracing::warn!("built without the 'sim' feature, running offline");
                Sources::default()
            }
            HardwareMode::Offline => {
                tracing::info!("offline mode, no data sources");
                Sources::default()
            }
        }
    }

    #[cfg(feature = "sim")]
    fn simulated(&self) -> Sources {
        use super::sim::{SimulatedSite, SiteProfile};
        use crate::domain::Location;

        let home = self.site.home_location().unwrap_or(Location::new(59.3293, 18.0686));
        let account = self.site.account.clone().unwrap_or_else(|| "simulated".to_string());
        let site = Arc::new(SimulatedSite::new(SiteProfile::default(), home, account));
        tracing::info!(
            latitude = home.latitude,
            longitude = home.longitude,
            charger = self.site.twc_manager_ip.is_some(),
            "using simulated site"
        );

        // The charger manager is only present when one is configured, so
        // the vehicle-inference path can be exercised too
        let charger: Option<Arc<dyn super::ChargerManager>> = match self.site.twc_manager_ip {
            Some(_) => Some(site.clone()),
            None => None,
        };
        Sources {
            gateway: Some(site.clone()),
            charger,
            cloud: Some(site.clone()),
            geocoder: Some(site),
        }
    }
}
