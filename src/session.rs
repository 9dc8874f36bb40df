use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::random_id;

/// A consultation between one doctor and one patient. Signaling for the call
/// is scoped to `id`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub doctor_id: String,
    pub patient_id: String,
}

impl Session {
    pub fn new(
        id: impl Into<String>,
        doctor_id: impl Into<String>,
        patient_id: impl Into<String>,
    ) -> Result<Self> {
        let session = Self {
            id: id.into(),
            doctor_id: doctor_id.into(),
            patient_id: patient_id.into(),
        };

        if session.id.is_empty() || session.doctor_id.is_empty() || session.patient_id.is_empty() {
            return Err(Error::invalid_state("session ids must not be empty"));
        }
        if session.doctor_id == session.patient_id {
            return Err(Error::invalid_state(format!(
                "session {} needs two distinct participants",
                session.id
            )));
        }
        Ok(session)
    }

    /// New session with a random id
    pub fn generate(doctor_id: impl Into<String>, patient_id: impl Into<String>) -> Result<Self> {
        Self::new(format!("session-{}", random_id()), doctor_id, patient_id)
    }

    /// The other participant, or `None` if `participant_id` is not part of
    /// this session
    pub fn peer_of(&self, participant_id: &str) -> Option<&str> {
        if participant_id == self.doctor_id {
            Some(&self.patient_id)
        } else if participant_id == self.patient_id {
            Some(&self.doctor_id)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_of_returns_the_other_participant() {
        let session = Session::new("s1", "doc", "pat").unwrap();
        assert_eq!(session.peer_of("doc"), Some("pat"));
        assert_eq!(session.peer_of("pat"), Some("doc"));
        assert_eq!(session.peer_of("nurse"), None);
    }

    #[test]
    fn identical_participants_are_rejected() {
        assert!(matches!(
            Session::new("s1", "doc", "doc"),
            Err(Error::InvalidState(_))
        ));
        assert!(Session::new("", "doc", "pat").is_err());
    }

    #[test]
    fn generated_sessions_have_unique_ids() {
        let a = Session::generate("doc", "pat").unwrap();
        let b = Session::generate("doc", "pat").unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("session-"));
    }
}
