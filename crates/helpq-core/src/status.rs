use serde::Serialize;

use crate::types::ClassroomQueue;

/// What a participant's view shows about the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StudentStatus {
    pub student_id: String,
    pub waiting: usize,
    /// 1-based; `None` when the student has nothing pending.
    pub position: Option<usize>,
    pub is_ta: bool,
}

impl StudentStatus {
    /// Build from a sorted snapshot. A missing queue document counts as empty.
    pub fn from_queue(student_id: &str, queue: Option<&ClassroomQueue>, is_ta: bool) -> Self {
        Self {
            student_id: student_id.to_string(),
            waiting: queue.map_or(0, ClassroomQueue::waiting),
            position: queue.and_then(|q| q.position_of(student_id)),
            is_ta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QueueItem, Timestamp};

    #[test]
    fn missing_queue_is_empty() {
        let s = StudentStatus::from_queue("s1", None, false);
        assert_eq!(s.waiting, 0);
        assert_eq!(s.position, None);
    }

    #[test]
    fn reports_position_in_sorted_queue() {
        let t = |secs| Timestamp::from_unix_seconds(secs).unwrap();
        let q = ClassroomQueue {
            queue: vec![
                QueueItem::new("a", "s2", t(5)),
                QueueItem::new("b", "s1", t(2)),
            ],
            resolved: vec![],
        }
        .sorted();
        let s = StudentStatus::from_queue("s2", Some(&q), false);
        assert_eq!(s.waiting, 2);
        assert_eq!(s.position, Some(2));
    }
}
