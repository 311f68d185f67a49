use std::time::Duration;
use shared::signal_queue::{Mailbox, TaskId, TimedSignalQueue};
use crate::config::DiscoveryConfig;
use crate::discovery_manager::DiscoveryHandle;

/// Register the periodic update, query and save tasks. An interval of zero
/// disables the corresponding task.
pub fn schedule(
    queue: &TimedSignalQueue,
    mailbox: &Mailbox,
    handle: &DiscoveryHandle,
    config: &DiscoveryConfig,
) -> Vec<TaskId> {
    let networks = config.network_mask();
    let mut tasks = Vec::new();

    if config.update_interval_secs > 0 {
        let handle = handle.clone();
        tasks.push(queue.schedule(
            mailbox,
            "update",
            Duration::from_secs(config.update_interval_secs),
            true,
            move || {
                for network in networks.networks() {
                    handle.update_network(network.into());
                }
            },
        ));
    }

    if config.query_interval_secs > 0 {
        let handle = handle.clone();
        tasks.push(queue.schedule(
            mailbox,
            "query",
            Duration::from_secs(config.query_interval_secs),
            true,
            move || {
                for network in networks.networks() {
                    handle.query_network(network.into());
                }
            },
        ));
    }

    if config.save_interval_secs > 0 {
        let handle = handle.clone();
        tasks.push(queue.schedule(
            mailbox,
            "save",
            Duration::from_secs(config.save_interval_secs),
            true,
            move || handle.queue_save(),
        ));
    }

    tracing::debug!("Scheduled {} maintenance tasks for {}", tasks.len(), networks);
    tasks
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::protocol::DISCOVERY_FILE;
    use shared::types::{Network, ServiceKind};
    use tokio_util::sync::CancellationToken;
    use crate::config::Config;
    use crate::discovery_manager::ManagerSettings;

    fn spawn(dir: &std::path::Path) -> DiscoveryHandle {
        let mut settings = ManagerSettings::from_config(&Config::default());
        settings.data_path = dir.to_path_buf();
        DiscoveryHandle::spawn(settings).unwrap().0
    }

    #[tokio::test]
    async fn test_zero_intervals_are_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn(dir.path());
        let queue = TimedSignalQueue::new(10);
        let (mailbox, _inbox) = Mailbox::new("discovery");

        let config = DiscoveryConfig {
            update_interval_secs: 0,
            query_interval_secs: 0,
            ..Default::default()
        };
        let tasks = schedule(&queue, &mailbox, &handle, &config);

        assert_eq!(tasks.len(), 1);
        assert!(queue.contains(tasks[0]));
        assert_eq!(schedule(&queue, &mailbox, &handle, &DiscoveryConfig::default()).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_save_writes_changes() {
        let dir = tempfile::tempdir().unwrap();
        let handle = spawn(dir.path());
        handle
            .add("http://a.example/", ServiceKind::Gwc, Network::G2.into(), 3)
            .await
            .unwrap();

        let queue = TimedSignalQueue::new(10);
        queue.start();
        let (mailbox, inbox) = Mailbox::new("discovery");
        let cancel = CancellationToken::new();
        let _inbox = inbox.spawn(cancel.clone());

        let config = DiscoveryConfig {
            update_interval_secs: 0,
            query_interval_secs: 0,
            save_interval_secs: 1,
            ..Default::default()
        };
        schedule(&queue, &mailbox, &handle, &config);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        // Commands are handled in order, so the save is done once this returns
        handle.count(None).await;

        assert!(dir.path().join(DISCOVERY_FILE).exists());
        queue.stop();
        cancel.cancel();
    }
}
