//! Per-room typing indicators with automatic expiry.
//!
//! Each `start` stamps the typist with a fresh generation and arms a timer.
//! A timer only stops typing if its generation is still current, so repeated
//! `start` calls push the expiry out instead of stacking stops.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::rooms::{RoomId, RoomManager};
use crate::ws::protocol::ServerEvent;

pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct TypingTracker {
    typists: Arc<DashMap<RoomId, HashMap<String, u64>>>,
    generation: Arc<AtomicU64>,
    rooms: RoomManager,
    timeout: Duration,
}

impl TypingTracker {
    pub fn new(rooms: RoomManager, timeout: Duration) -> Self {
        Self {
            typists: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
            rooms,
            timeout,
        }
    }

    /// Mark a user as typing. Broadcasts `typing_start` only on the
    /// idle-to-typing transition; every call re-arms the expiry.
    pub fn start(&self, room_id: &RoomId, user_id: &str) -> bool {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let started = self
            .typists
            .entry(room_id.clone())
            .or_default()
            .insert(user_id.to_string(), generation)
            .is_none();

        if started {
            let event = Arc::new(ServerEvent::TypingStart {
                room_id: room_id.clone(),
                user_id: user_id.to_string(),
            });
            self.rooms.send_to_room(room_id, event, Some(user_id));
        }

        let tracker = self.clone();
        let room_id = room_id.clone();
        let user_id = user_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(tracker.timeout).await;
            if tracker.remove_if_generation(&room_id, &user_id, Some(generation)) {
                tracing::debug!(room_id = %room_id, user_id = %user_id, "Typing expired");
            }
        });

        started
    }

    /// Stop typing. Broadcasts exactly one `typing_stop` if the user was
    /// typing; otherwise does nothing.
    pub fn stop(&self, room_id: &RoomId, user_id: &str) -> bool {
        self.remove_if_generation(room_id, user_id, None)
    }

    /// Stop typing in every room the user is typing in.
    pub fn stop_everywhere(&self, user_id: &str) -> usize {
        let rooms: Vec<RoomId> = self
            .typists
            .iter()
            .filter(|r| r.contains_key(user_id))
            .map(|r| r.key().clone())
            .collect();
        rooms
            .iter()
            .filter(|room_id| self.stop(room_id, user_id))
            .count()
    }

    pub fn is_typing(&self, room_id: &RoomId, user_id: &str) -> bool {
        self.typists
            .get(room_id)
            .map(|r| r.contains_key(user_id))
            .unwrap_or(false)
    }

    pub fn typists(&self, room_id: &RoomId) -> Vec<String> {
        let mut users: Vec<String> = self
            .typists
            .get(room_id)
            .map(|r| r.keys().cloned().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Remove the typist and broadcast the stop. With `Some(generation)`
    /// the removal only happens if no later `start` replaced it.
    fn remove_if_generation(&self, room_id: &RoomId, user_id: &str, generation: Option<u64>) -> bool {
        let (removed, empty) = match self.typists.get_mut(room_id) {
            Some(mut room) => {
                let current = room.get(user_id).copied();
                let matches = match (current, generation) {
                    (None, _) => false,
                    (Some(_), None) => true,
                    (Some(current), Some(expected)) => current == expected,
                };
                if matches {
                    room.remove(user_id);
                }
                (matches, room.is_empty())
            }
            None => return false,
        };
        if empty {
            self.typists.remove_if(room_id, |_, room| room.is_empty());
        }
        if removed {
            let event = Arc::new(ServerEvent::TypingStop {
                room_id: room_id.clone(),
                user_id: user_id.to_string(),
            });
            self.rooms.send_to_room(room_id, event, Some(user_id));
        }
        removed
    }
}
