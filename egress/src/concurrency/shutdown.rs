use tokio::sync::watch;

/// Transmitter side of the shutdown coordination channel.
///
/// [`ShutdownTx`] broadcasts a shutdown signal to every long-lived task of a
/// router. Tasks should respond by completing their current operation and
/// terminating.
#[derive(Debug, Clone)]
pub struct ShutdownTx(watch::Sender<()>);

impl ShutdownTx {
    /// Triggers shutdown for all subscribed tasks.
    pub fn shutdown(&self) -> Result<(), watch::error::SendError<()>> {
        self.0.send(())
    }

    /// Creates a new shutdown receiver for task subscription.
    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

/// Receiver side of the shutdown coordination channel.
pub type ShutdownRx = watch::Receiver<()>;

/// Creates a new shutdown coordination channel.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(());
    (ShutdownTx(tx), rx)
}
