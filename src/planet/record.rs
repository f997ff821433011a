use crate::planet::config::ComponentConfig;
use crate::planet::message::Message;
use crate::planet::mood::Mood;
use crate::utils::lock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// Self-reported state of a running component job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobState {
    pub mood: Mood,
    /// Names of the pipeline elements the job is built from
    #[serde(default)]
    pub elements: Vec<String>,
    pub pid: u32,
    pub worker_name: String,
    /// Manager address as seen from the job
    #[serde(default)]
    pub manager_ip: Option<String>,
}

/// Durable configuration and last-known health of one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ComponentRecord {
    pub config: ComponentConfig,
    #[serde(default)]
    pub worker_requested: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub mood: Mood,
    #[serde(default)]
    pub mood_pending: Option<Mood>,
    /// Present only while a session is bound to the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobState>,
}

impl ComponentRecord {
    pub fn new(config: ComponentConfig) -> Self {
        ComponentRecord {
            worker_requested: config.worker.clone(),
            config,
            messages: Vec::new(),
            mood: Mood::Sleeping,
            mood_pending: None,
            job: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn parent(&self) -> &str {
        &self.config.parent
    }

    pub fn kind(&self) -> &str {
        &self.config.kind
    }

    pub fn avatar_id(&self) -> String {
        self.config.avatar_id()
    }

    pub fn is_attached(&self) -> bool {
        self.job.is_some()
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
    }

    /// Replace a message with the same id, or append it
    pub fn set_message(&mut self, message: Message) {
        self.messages.retain(|m| m.id != message.id);
        self.messages.push(message);
    }

    pub fn clear_messages(&mut self) -> Vec<Message> {
        std::mem::take(&mut self.messages)
    }

    /// Returns true if the mood actually changed
    pub fn set_mood(&mut self, mood: Mood) -> bool {
        let changed = self.mood != mood;
        self.mood = mood;
        changed
    }

    pub fn attach_job(&mut self, job: JobState) {
        self.mood = job.mood;
        self.job = Some(job);
    }

    pub fn detach_job(&mut self) -> Option<JobState> {
        self.job.take()
    }
}

/// Handle on a record shared by the planet and the live session bound to it
#[derive(Debug, Clone)]
pub struct SharedRecord(Arc<Mutex<ComponentRecord>>);

impl SharedRecord {
    pub fn new(record: ComponentRecord) -> Self {
        SharedRecord(Arc::new(Mutex::new(record)))
    }

    pub fn read<R>(&self, f: impl FnOnce(&ComponentRecord) -> R) -> R {
        f(&lock(&self.0))
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut ComponentRecord) -> R) -> R {
        f(&mut lock(&self.0))
    }

    pub fn snapshot(&self) -> ComponentRecord {
        lock(&self.0).clone()
    }

    pub fn config(&self) -> ComponentConfig {
        self.read(|r| r.config.clone())
    }
}

#[cfg(test)]
impl SharedRecord {
    pub fn mood(&self) -> Mood {
        self.read(|r| r.mood)
    }

    pub fn ptr_eq(&self, other: &SharedRecord) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(mood: Mood) -> JobState {
        JobState {
            mood,
            elements: vec!["src".into()],
            pid: 42,
            worker_name: "localhost".into(),
            manager_ip: None,
        }
    }

    #[test]
    fn test_attach_follows_job_mood() {
        let mut record = ComponentRecord::new(ComponentConfig::new("live", "producer", "videotest"));
        assert_eq!(record.mood, Mood::Sleeping);

        record.attach_job(job(Mood::Waking));
        assert!(record.is_attached());
        assert_eq!(record.mood, Mood::Waking);

        assert!(record.detach_job().is_some());
        assert!(!record.is_attached());
    }

    #[test]
    fn test_set_message_replaces_same_id() {
        let mut record = ComponentRecord::new(ComponentConfig::new("live", "producer", "videotest"));
        record.set_message(Message::warning("provide-master-clock", "first"));
        record.set_message(Message::warning("provide-master-clock", "second"));
        record.add_message(Message::warning("stale-config", "third"));

        assert_eq!(record.messages.len(), 2);
        assert_eq!(record.clear_messages().len(), 2);
        assert!(record.messages.is_empty());
    }

    #[test]
    fn test_shared_record_is_shared() {
        let shared = SharedRecord::new(ComponentRecord::new(ComponentConfig::new(
            "live", "producer", "videotest",
        )));
        let other = shared.clone();
        other.update(|r| r.set_mood(Mood::Happy));

        assert_eq!(shared.mood(), Mood::Happy);
        assert!(shared.ptr_eq(&other));
    }
}
