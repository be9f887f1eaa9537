//! Progress events and the per-chapter broadcast hub.
//!
//! The orchestrator is the single writer for a chapter, so publishing onto
//! the chapter's broadcast channel preserves emission order end to end.
//! Ordering across chapters is not guaranteed.

pub mod ws;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::errors::ErrorKind;
use crate::model::StageId;

/// Buffered events per chapter channel before slow subscribers lag.
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    StageStart,
    StageComplete,
    SectionReady,
    ChapterComplete,
    ChapterFailed,
    Heartbeat,
}

/// One typed message on the per-chapter stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub event: EventKind,
    pub chapter_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    fn new(event: EventKind, chapter_id: Uuid) -> Self {
        Self {
            event,
            chapter_id,
            stage: None,
            stage_number: None,
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn stage_start(chapter_id: Uuid, stage: StageId) -> Self {
        let mut event = Self::new(EventKind::StageStart, chapter_id);
        event.stage = Some(stage.as_str().to_string());
        event.stage_number = Some(stage.number());
        event
    }

    pub fn stage_complete(chapter_id: Uuid, stage: StageId, data: serde_json::Value) -> Self {
        let mut event = Self::new(EventKind::StageComplete, chapter_id);
        event.stage = Some(stage.as_str().to_string());
        event.stage_number = Some(stage.number());
        event.data = Some(data);
        event
    }

    pub fn section_ready(
        chapter_id: Uuid,
        section_number: usize,
        section_title: &str,
        section_content: &str,
        total_sections: usize,
    ) -> Self {
        let mut event = Self::new(EventKind::SectionReady, chapter_id);
        event.stage = Some(StageId::SectionGeneration.as_str().to_string());
        event.stage_number = Some(StageId::SectionGeneration.number());
        let progress_percent = if total_sections == 0 {
            100.0
        } else {
            ((section_number + 1) as f64 / total_sections as f64) * 100.0
        };
        event.data = Some(serde_json::json!({
            "section_number": section_number,
            "section_title": section_title,
            "section_content": section_content,
            "total_sections": total_sections,
            "progress_percent": progress_percent,
        }));
        event
    }

    pub fn chapter_complete(chapter_id: Uuid, version: u32) -> Self {
        let mut event = Self::new(EventKind::ChapterComplete, chapter_id);
        event.data = Some(serde_json::json!({"version": version}));
        event
    }

    pub fn chapter_failed(chapter_id: Uuid, kind: ErrorKind, message: &str) -> Self {
        let mut event = Self::new(EventKind::ChapterFailed, chapter_id);
        event.data = Some(serde_json::json!({
            "kind": kind.as_str(),
            "message": message,
        }));
        event
    }

    pub fn heartbeat(chapter_id: Uuid) -> Self {
        Self::new(EventKind::Heartbeat, chapter_id)
    }
}

/// Routes events to the subscribers of each chapter id.
#[derive(Default)]
pub struct ProgressHub {
    rooms: DashMap<Uuid, broadcast::Sender<ProgressEvent>>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn room(&self, chapter_id: Uuid) -> broadcast::Sender<ProgressEvent> {
        self.rooms
            .entry(chapter_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Deliver to current subscribers; a chapter with no subscribers drops
    /// the event silently.
    pub fn publish(&self, event: ProgressEvent) {
        let _ = self.room(event.chapter_id).send(event);
    }

    pub fn subscribe(&self, chapter_id: Uuid) -> broadcast::Receiver<ProgressEvent> {
        self.room(chapter_id).subscribe()
    }

    /// Drop the room once a chapter reaches a terminal state and the last
    /// subscriber disconnects.
    pub fn remove_if_idle(&self, chapter_id: Uuid) {
        self.rooms
            .remove_if(&chapter_id, |_, sender| sender.receiver_count() == 0);
    }
}
