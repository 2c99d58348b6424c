//! Alert configuration and dispatch for attribute changes.
//!
//! The alert list lives in the configuration store's alerts section and
//! is re-read whenever a change notification says it moved. Attribute
//! commits fan out to the configured agents through the executor.

use tracing::{debug, info, warn};

use roost_proto::alert::AlertEntry;

use crate::daemon::Attrd;

/// (Re)load the alert list from the store's alerts section.
pub async fn read_alert_config(attrd: &Attrd) {
    match attrd.cib.query_section("alerts").await {
        Ok(Some(bytes)) => match bincode::deserialize::<Vec<AlertEntry>>(&bytes) {
            Ok(entries) => {
                info!("loaded {} alert entries", entries.len());
                attrd.sys.write().await.alerts = entries;
            }
            Err(err) => warn!("could not decode alerts section: {}", err),
        },
        Ok(None) => {
            debug!("store has no alerts section");
            attrd.sys.write().await.alerts.clear();
        }
        Err(err) => {
            info!("could not query alerts section: {}", err);
        }
    }
}

/// Run the attribute alert agents for one committed change.
pub async fn send_attribute_alert(attrd: &Attrd, node: &str, name: &str, value: &str) {
    let alerts = attrd.sys.read().await.alerts.clone();
    if alerts.is_empty() {
        return;
    }
    roost_exec::alerts::send_attribute_alert(&attrd.executor, &alerts, node, 0, name, value).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use roost_core::bus::LocalBus;
    use roost_core::cib::LocalCib;
    use roost_exec::executor::Executor;
    use roost_exec::registry::{AgentRoots, Registry};
    use std::sync::Arc;

    fn fixture() -> (Attrd, Arc<LocalCib>) {
        let cib = Arc::new(LocalCib::new());
        let bus = Arc::new(LocalBus::new("node1"));
        let executor = Executor::new(Registry::new(AgentRoots::default()));
        let attrd = Attrd::new("node1", cib.clone(), bus, executor);
        (attrd, cib)
    }

    #[tokio::test]
    async fn test_alert_config_round_trips_through_store() {
        let (attrd, cib) = fixture();

        let entries = vec![AlertEntry::new("a1", "/usr/share/alerts/log.sh")];
        cib.put_section("alerts", bincode::serialize(&entries).unwrap())
            .await
            .unwrap();

        read_alert_config(&attrd).await;
        let sys = attrd.sys.read().await;
        assert_eq!(sys.alerts.len(), 1);
        assert_eq!(sys.alerts[0].id, "a1");
    }

    #[tokio::test]
    async fn test_missing_section_clears_the_list() {
        let (attrd, _cib) = fixture();
        attrd
            .sys
            .write()
            .await
            .alerts
            .push(AlertEntry::new("stale", "/bin/true"));

        read_alert_config(&attrd).await;
        assert!(attrd.sys.read().await.alerts.is_empty());
    }
}
