//! Vector storage and k-nearest-neighbour search.
//!
//! Vectors live in `note_vectors`, one row per note, tagged with the owner
//! and dimension. Queries scan the owner's rows of matching dimension and
//! rank them by cosine distance.

use std::cmp::Ordering;

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::db::{Database, StoreError};
use crate::domain::{Embedding, NoteId, OwnerId};

/// A search hit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub note_id: NoteId,

    /// `1 - cosine_similarity`; 0 means same direction
    pub distance: f32,
}

/// Per-note vector index
#[derive(Clone)]
pub struct VectorStore {
    db: Database,
}

impl VectorStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert or replace a note's vector
    pub fn store(
        &self,
        note_id: NoteId,
        owner: OwnerId,
        embedding: &Embedding,
    ) -> Result<(), StoreError> {
        let conn = self.db.lock()?;
        Self::store_with(&conn, note_id, owner, embedding)
    }

    /// Upsert on an already-locked connection (used inside transactions)
    pub(crate) fn store_with(
        conn: &Connection,
        note_id: NoteId,
        owner: OwnerId,
        embedding: &Embedding,
    ) -> Result<(), StoreError> {
        conn.execute(
            "INSERT INTO note_vectors (note_id, owner_id, dim, embedding) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(note_id) DO UPDATE SET
                 owner_id = excluded.owner_id,
                 dim = excluded.dim,
                 embedding = excluded.embedding",
            params![note_id, owner, embedding.dim() as i64, embedding.to_bytes()],
        )?;
        Ok(())
    }

    pub fn remove(&self, note_id: NoteId) -> Result<bool, StoreError> {
        let conn = self.db.lock()?;
        let removed = conn.execute(
            "DELETE FROM note_vectors WHERE note_id = ?1",
            params![note_id],
        )?;
        Ok(removed > 0)
    }

    pub fn get(&self, note_id: NoteId) -> Result<Option<Embedding>, StoreError> {
        let conn = self.db.lock()?;
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT embedding FROM note_vectors WHERE note_id = ?1",
                params![note_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes.and_then(|b| Embedding::from_bytes(&b)))
    }

    /// The `limit` nearest active notes of `owner`, nearest first.
    ///
    /// Vectors of another dimension are skipped, as are archived notes and
    /// anything in `exclude`. Ties are broken by note id.
    pub fn query(
        &self,
        owner: OwnerId,
        vector: &[f32],
        limit: usize,
        exclude: &[NoteId],
    ) -> Result<Vec<Neighbor>, StoreError> {
        if limit == 0 || vector.is_empty() {
            return Ok(Vec::new());
        }

        let candidates: Vec<(NoteId, Vec<u8>)> = {
            let conn = self.db.lock()?;
            let mut stmt = conn.prepare(
                "SELECT v.note_id, v.embedding
                 FROM note_vectors v JOIN notes n ON n.id = v.note_id
                 WHERE v.owner_id = ?1 AND n.owner_id = ?1 AND n.archived = 0 AND v.dim = ?2",
            )?;
            let rows = stmt
                .query_map(params![owner, vector.len() as i64], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };

        let mut neighbors: Vec<Neighbor> = candidates
            .into_iter()
            .filter(|(id, _)| !exclude.contains(id))
            .filter_map(|(note_id, bytes)| {
                let stored = Embedding::from_bytes(&bytes)?;
                (stored.dim() == vector.len()).then(|| Neighbor {
                    note_id,
                    distance: cosine_distance(vector, stored.values()),
                })
            })
            .collect();

        neighbors.sort_by(|a, b| match a.distance.total_cmp(&b.distance) {
            Ordering::Equal => a.note_id.cmp(&b.note_id),
            other => other,
        });
        neighbors.truncate(limit);
        Ok(neighbors)
    }
}

/// `1 - cos(a, b)`. A zero vector has similarity 0 with everything.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (*x as f64, *y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    (1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_distance() {
        assert!(cosine_distance(&[1.0, 0.0], &[2.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn test_empty_query_returns_nothing() {
        let store = VectorStore::new(Database::open_in_memory().unwrap());
        assert!(store.query(1, &[], 5, &[]).unwrap().is_empty());
        assert!(store.query(1, &[1.0], 0, &[]).unwrap().is_empty());
    }
}
