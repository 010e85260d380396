use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::concurrency::shutdown::ShutdownRx;
use crate::types::{Binding, DestinationType, Sources};

/// The enabled-binding list maintained by the config subscriber.
///
/// Swapped atomically on each topology snapshot; readers take a cloned
/// snapshot that stays stable for the duration of one scheduling pass.
#[derive(Debug, Clone, Default)]
pub struct EnabledBindings {
    inner: Arc<RwLock<Vec<Binding>>>,
}

impl EnabledBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a stable snapshot of the current bindings.
    pub fn snapshot(&self) -> Vec<Binding> {
        self.inner.read().expect("bindings lock poisoned").clone()
    }

    fn replace(&self, bindings: Vec<Binding>) {
        *self.inner.write().expect("bindings lock poisoned") = bindings;
    }
}

/// Rebuilds the enabled-binding list from a topology snapshot.
///
/// Keeps every enabled destination of an enabled source whose type is in the
/// supported set.
pub fn rebuild_bindings(sources: &Sources, supported: &[DestinationType]) -> Vec<Binding> {
    let mut bindings = Vec::new();

    for source in &sources.sources {
        if !source.enabled || source.destinations.is_empty() {
            continue;
        }
        for destination in &source.destinations {
            if destination.enabled && supported.contains(&destination.destination_type) {
                bindings.push(Binding {
                    source: source.clone(),
                    destination: destination.clone(),
                });
            }
        }
    }

    bindings
}

/// Spawns the config subscriber task.
///
/// Each received snapshot fully replaces the previous topology.
pub fn spawn_config_subscriber(
    mut config_rx: mpsc::Receiver<Sources>,
    bindings: EnabledBindings,
    supported: Vec<DestinationType>,
    mut shutdown_rx: ShutdownRx,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("config subscriber shutting down");
                    return;
                }
                snapshot = config_rx.recv() => {
                    let Some(snapshot) = snapshot else {
                        info!("config stream closed, subscriber exiting");
                        return;
                    };

                    let rebuilt = rebuild_bindings(&snapshot, &supported);
                    debug!("rebuilt {} enabled bindings", rebuilt.len());
                    bindings.replace(rebuilt);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Destination, Source};

    fn sources() -> Sources {
        Sources {
            sources: vec![
                Source {
                    id: "src1".into(),
                    name: "one".into(),
                    enabled: true,
                    destinations: vec![
                        Destination {
                            id: "d1".into(),
                            enabled: true,
                            destination_type: DestinationType::S3,
                            config: serde_json::json!({}),
                        },
                        Destination {
                            id: "d2".into(),
                            enabled: false,
                            destination_type: DestinationType::S3,
                            config: serde_json::json!({}),
                        },
                        Destination {
                            id: "d3".into(),
                            enabled: true,
                            destination_type: DestinationType::Redshift,
                            config: serde_json::json!({}),
                        },
                    ],
                },
                Source {
                    id: "src2".into(),
                    name: "two".into(),
                    enabled: false,
                    destinations: vec![Destination {
                        id: "d4".into(),
                        enabled: true,
                        destination_type: DestinationType::S3,
                        config: serde_json::json!({}),
                    }],
                },
            ],
        }
    }

    #[test]
    fn rebuild_filters_disabled_and_unsupported() {
        let bindings = rebuild_bindings(&sources(), &DestinationType::ALL.to_vec());
        let keys: Vec<String> = bindings.iter().map(|b| b.in_progress_key()).collect();
        assert_eq!(keys, vec!["src1_d1", "src1_d3"]);
    }

    #[test]
    fn rebuild_respects_supported_set() {
        let bindings = rebuild_bindings(&sources(), &[DestinationType::Redshift]);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].destination.id, "d3");
    }

    #[tokio::test]
    async fn snapshots_replace_previous_topology() {
        let bindings = EnabledBindings::new();
        let (tx, rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = crate::concurrency::shutdown::create_shutdown_channel();

        let handle = spawn_config_subscriber(
            rx,
            bindings.clone(),
            DestinationType::ALL.to_vec(),
            shutdown_rx,
        );

        tx.send(sources()).await.unwrap();
        // Empty snapshot wipes the list.
        tx.send(Sources::default()).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert!(bindings.snapshot().is_empty());
        drop(shutdown_tx);
    }
}
