use rumqttc::{AsyncClient, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Outbound broker traffic. Zones and the registry enqueue commands instead
/// of touching the client, so nothing blocks on the network while holding a
/// zone lock.
#[derive(Debug)]
pub enum TransportCommand {
    Publish {
        topic: String,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    },
    Subscribe {
        filter: String,
        qos: QoS,
    },
    Unsubscribe {
        filter: String,
    },
}

pub type CommandSender = mpsc::UnboundedSender<TransportCommand>;
pub type CommandReceiver = mpsc::UnboundedReceiver<TransportCommand>;

pub fn command_channel() -> (CommandSender, CommandReceiver) {
    mpsc::unbounded_channel()
}

pub fn spawn_command_pump(client: AsyncClient, mut commands: CommandReceiver) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(command) = commands.recv().await {
            let result = match command {
                TransportCommand::Publish {
                    topic,
                    payload,
                    qos,
                    retain,
                } => client.publish(topic, qos, retain, payload).await,
                TransportCommand::Subscribe { filter, qos } => client.subscribe(filter, qos).await,
                TransportCommand::Unsubscribe { filter } => client.unsubscribe(filter).await,
            };

            if let Err(err) = result {
                warn!("transport command failed: {err}");
            }
        }
        debug!("transport command channel closed");
    })
}
