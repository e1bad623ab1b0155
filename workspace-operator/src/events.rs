use kaito_common::MANAGER_NAME;
use kaito_types::Workspace;
use kube::{
    Client, Resource,
    runtime::events::{Event, EventType, Recorder, Reporter},
};

/// Best-effort event publisher for Workspace lifecycle events. Failures are
/// logged and swallowed: an event must never fail a reconcile.
#[derive(Clone)]
pub struct EventSink {
    recorder: Recorder,
}

impl EventSink {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: MANAGER_NAME.into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        EventSink {
            recorder: Recorder::new(client, reporter),
        }
    }

    pub async fn normal(&self, instance: &Workspace, reason: &str, action: &str, note: String) {
        self.publish(instance, EventType::Normal, reason, action, note)
            .await;
    }

    pub async fn warning(&self, instance: &Workspace, reason: &str, action: &str, note: String) {
        self.publish(instance, EventType::Warning, reason, action, note)
            .await;
    }

    async fn publish(
        &self,
        instance: &Workspace,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let reference = instance.object_ref(&());
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(note),
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            eprintln!("failed to publish event '{}': {}", reason, e);
        }
    }
}
