//! Notification and audit consumers

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::inbox::{AuditEntry, ConsumerEffect, ConsumerError, MessageConsumer, Notification};
use super::outbox::OutboxMessage;
use crate::workflow::{WorkflowEvent, WorkflowEventKind};

/// Tells assignees about new tasks and requesters about finished workflows
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationConsumer;

impl NotificationConsumer {
    pub const NAME: &'static str = "notifications";

    fn notification(
        event: &WorkflowEvent,
        message: &OutboxMessage,
        recipient: &str,
        subject: String,
        body: String,
    ) -> ConsumerEffect {
        ConsumerEffect::Notify(Notification {
            id: Uuid::now_v7(),
            recipient: recipient.to_string(),
            instance_id: Some(event.instance_id),
            activity_id: event.activity_id.clone(),
            subject,
            body,
            source_message_id: message.id,
            created_at: Utc::now(),
        })
    }
}

#[async_trait]
impl MessageConsumer for NotificationConsumer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn accepts(&self, message_type: &str) -> bool {
        matches!(
            message_type,
            "workflow.task_assigned" | "workflow.completed" | "workflow.faulted"
        )
    }

    async fn handle(&self, message: &OutboxMessage) -> Result<Vec<ConsumerEffect>, ConsumerError> {
        let event = message.decode_event()?;
        let activity = event.activity_id.as_deref().unwrap_or("-");

        let effects = match &event.kind {
            WorkflowEventKind::TaskAssigned { .. } => match event.assignee.as_deref() {
                Some(assignee) => vec![Self::notification(
                    &event,
                    message,
                    assignee,
                    format!("New task: {activity}"),
                    format!(
                        "Activity {activity} of workflow {} is waiting for you.",
                        event.instance_id
                    ),
                )],
                None => Vec::new(),
            },
            WorkflowEventKind::WorkflowCompleted => vec![Self::notification(
                &event,
                message,
                &event.started_by,
                format!("Workflow {} completed", event.instance_id),
                format!("Workflow {} finished successfully.", event.definition_id),
            )],
            WorkflowEventKind::WorkflowFaulted { reason } => vec![Self::notification(
                &event,
                message,
                &event.started_by,
                format!("Workflow {} faulted", event.instance_id),
                reason.clone(),
            )],
            _ => Vec::new(),
        };

        Ok(effects)
    }
}

/// Records every workflow event in the audit log
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditConsumer;

impl AuditConsumer {
    pub const NAME: &'static str = "audit";
}

#[async_trait]
impl MessageConsumer for AuditConsumer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn accepts(&self, message_type: &str) -> bool {
        message_type.starts_with("workflow.")
    }

    async fn handle(&self, message: &OutboxMessage) -> Result<Vec<ConsumerEffect>, ConsumerError> {
        let event = message.decode_event()?;

        Ok(vec![ConsumerEffect::Audit(AuditEntry {
            id: Uuid::now_v7(),
            instance_id: event.instance_id,
            activity_id: event.activity_id.clone(),
            message_type: message.message_type.clone(),
            assignee: event.assignee.clone(),
            correlation_id: event.correlation_id.clone(),
            payload: message.payload.clone(),
            source_message_id: message.id,
            recorded_at: Utc::now(),
        })])
    }
}
