//! SQLite-backed relational store for chapters, versions, and the indexed
//! document corpus.
//!
//! Writes are short single-transaction statements per stage; there are no
//! cross-stage transactions. Chapters persist as indexed scalar columns for
//! querying plus one JSON document column holding the full typed value, so
//! a load always reconstructs the exact in-memory structure.

use std::path::Path;

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::model::{
    Chapter, ChapterVersion, Chunk, Document, DocumentStatus, GapReport, ImageRecord, StageId,
};

pub struct ChapterStore {
    conn: Connection,
}

impl ChapterStore {
    /// Open (or create) the database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    /// In-memory database for tests and ephemeral runs.
    pub fn new_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        self.run_migrations()
    }

    fn run_migrations(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS chapters (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'in_progress',
                current_stage TEXT NOT NULL DEFAULT 'input_valid',
                version INTEGER NOT NULL DEFAULT 0,
                doc TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chapter_versions (
                chapter_id TEXT NOT NULL REFERENCES chapters(id) ON DELETE CASCADE,
                version INTEGER NOT NULL,
                snapshot TEXT NOT NULL,
                is_current INTEGER NOT NULL DEFAULT 0,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (chapter_id, version)
            );

            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                authors TEXT NOT NULL DEFAULT '[]',
                year INTEGER,
                status TEXT NOT NULL DEFAULT 'pending',
                citations TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                page INTEGER NOT NULL,
                content TEXT NOT NULL,
                embedding TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS images (
                id TEXT PRIMARY KEY,
                document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
                page INTEGER NOT NULL,
                bytes_path TEXT NOT NULL,
                analysis TEXT,
                relevance REAL NOT NULL DEFAULT 0
            );

            CREATE TABLE IF NOT EXISTS gap_analyses (
                chapter_id TEXT NOT NULL REFERENCES chapters(id) ON DELETE CASCADE,
                score REAL NOT NULL,
                report TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_chapters_owner ON chapters(owner_id);
            CREATE INDEX IF NOT EXISTS idx_chapters_status ON chapters(status);
            CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id);
            CREATE INDEX IF NOT EXISTS idx_images_document ON images(document_id);
            CREATE INDEX IF NOT EXISTS idx_versions_current
                ON chapter_versions(chapter_id, is_current);
            ",
        )?;
        Ok(())
    }

    // ── Chapters ──────────────────────────────────────────────────────

    pub fn create_chapter(&self, chapter: &Chapter) -> Result<(), StoreError> {
        let doc = serde_json::to_string(chapter)?;
        self.conn.execute(
            "INSERT INTO chapters (id, owner_id, status, current_stage, version, doc, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                chapter.id.to_string(),
                chapter.owner_id,
                chapter.status.as_str(),
                chapter.current_stage.as_str(),
                chapter.version,
                doc,
                chapter.created_at.to_rfc3339(),
                chapter.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_chapter(&self, id: Uuid) -> Result<Option<Chapter>, StoreError> {
        let doc: Option<String> = self
            .conn
            .query_row(
                "SELECT doc FROM chapters WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        match doc {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Persist the chapter after a stage completes. The stored stage may
    /// never regress; a mismatch means two writers raced and the update is
    /// rejected as a conflict.
    pub fn save_chapter(&self, chapter: &Chapter) -> Result<(), StoreError> {
        let stored_stage: Option<String> = self
            .conn
            .query_row(
                "SELECT current_stage FROM chapters WHERE id = ?1",
                params![chapter.id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let stored_stage = stored_stage.ok_or_else(|| StoreError::NotFound {
            entity: "chapter",
            id: chapter.id.to_string(),
        })?;
        let stored =
            StageId::from_str(&stored_stage).map_err(|e| StoreError::Conflict(e.to_string()))?;
        if chapter.current_stage < stored {
            return Err(StoreError::Conflict(format!(
                "stage would regress from {} to {}",
                stored, chapter.current_stage
            )));
        }

        let doc = serde_json::to_string(chapter)?;
        self.conn.execute(
            "UPDATE chapters
             SET status = ?2, current_stage = ?3, version = ?4, doc = ?5, updated_at = ?6
             WHERE id = ?1",
            params![
                chapter.id.to_string(),
                chapter.status.as_str(),
                chapter.current_stage.as_str(),
                chapter.version,
                doc,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn list_chapters_for(&self, owner_id: &str) -> Result<Vec<Chapter>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT doc FROM chapters WHERE owner_id = ?1 ORDER BY created_at")?;
        let rows = stmt.query_map(params![owner_id], |row| row.get::<_, String>(0))?;
        let mut chapters = Vec::new();
        for row in rows {
            chapters.push(serde_json::from_str(&row?)?);
        }
        Ok(chapters)
    }

    // ── Versions ──────────────────────────────────────────────────────

    /// Insert a snapshot and mark it current, clearing the flag on every
    /// other version of the chapter in the same transaction.
    pub fn create_version(&mut self, version: &ChapterVersion) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "UPDATE chapter_versions SET is_current = 0 WHERE chapter_id = ?1",
            params![version.chapter_id.to_string()],
        )?;
        tx.execute(
            "INSERT INTO chapter_versions (chapter_id, version, snapshot, is_current, created_by, created_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)",
            params![
                version.chapter_id.to_string(),
                version.version,
                serde_json::to_string(version)?,
                version.created_by,
                version.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn list_versions(&self, chapter_id: Uuid) -> Result<Vec<ChapterVersion>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT snapshot, is_current FROM chapter_versions
             WHERE chapter_id = ?1 ORDER BY version",
        )?;
        let rows = stmt.query_map(params![chapter_id.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut versions = Vec::new();
        for row in rows {
            let (snapshot, is_current) = row?;
            let mut version: ChapterVersion = serde_json::from_str(&snapshot)?;
            version.is_current = is_current != 0;
            versions.push(version);
        }
        Ok(versions)
    }

    // ── Documents & chunks ────────────────────────────────────────────

    pub fn insert_document(&self, document: &Document) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO documents (id, title, authors, year, status, citations, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                document.id,
                document.title,
                serde_json::to_string(&document.authors)?,
                document.year,
                document.status.as_str(),
                serde_json::to_string(&document.citations)?,
                document.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Replace the extracted citation strings for a document.
    pub fn set_document_citations(
        &self,
        document_id: &str,
        citations: &[String],
    ) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE documents SET citations = ?2 WHERE id = ?1",
            params![document_id, serde_json::to_string(citations)?],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "document",
                id: document_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_document_status(
        &self,
        document_id: &str,
        status: DocumentStatus,
    ) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE documents SET status = ?2 WHERE id = ?1",
            params![document_id, status.as_str()],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "document",
                id: document_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn get_document(&self, id: &str) -> Result<Option<Document>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, title, authors, year, status, citations, created_at
                 FROM documents WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<i32>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?
            .map(Self::row_to_document)
            .transpose()
    }

    #[allow(clippy::type_complexity)]
    fn row_to_document(
        row: (String, String, String, Option<i32>, String, String, String),
    ) -> Result<Document, StoreError> {
        let (id, title, authors, year, status, citations, created_at) = row;
        Ok(Document {
            id,
            title,
            authors: serde_json::from_str(&authors)?,
            year,
            status: DocumentStatus::from_str(&status)
                .map_err(|e| StoreError::Conflict(e.to_string()))?,
            citations: serde_json::from_str(&citations)?,
            created_at: created_at
                .parse()
                .map_err(|e| StoreError::Conflict(format!("bad timestamp: {e}")))?,
        })
    }

    /// Idempotent: an ingestion phase replayed after a partial write
    /// overwrites its own rows.
    pub fn insert_chunk(&self, chunk: &Chunk) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO chunks (id, document_id, page, content, embedding)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                chunk.id,
                chunk.document_id,
                chunk.page,
                chunk.content,
                serde_json::to_string(&chunk.embedding)?,
            ],
        )?;
        Ok(())
    }

    /// Every chunk belonging to a committed document, for similarity search.
    pub fn committed_chunks(&self) -> Result<Vec<Chunk>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id, c.document_id, c.page, c.content, c.embedding
             FROM chunks c JOIN documents d ON d.id = c.document_id
             WHERE d.status = 'committed'
             ORDER BY c.document_id, c.page",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut chunks = Vec::new();
        for row in rows {
            let (id, document_id, page, content, embedding) = row?;
            chunks.push(Chunk {
                id,
                document_id,
                page,
                content,
                embedding: serde_json::from_str(&embedding)?,
            });
        }
        Ok(chunks)
    }

    /// Chunks of one document in page order, committed or not. Used by the
    /// ingestion pipeline before the document is visible to research.
    pub fn chunks_for_document(&self, document_id: &str) -> Result<Vec<Chunk>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, document_id, page, content, embedding
             FROM chunks WHERE document_id = ?1 ORDER BY page, id",
        )?;
        let rows = stmt.query_map(params![document_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut chunks = Vec::new();
        for row in rows {
            let (id, document_id, page, content, embedding) = row?;
            chunks.push(Chunk {
                id,
                document_id,
                page,
                content,
                embedding: serde_json::from_str(&embedding)?,
            });
        }
        Ok(chunks)
    }

    pub fn update_chunk_embedding(
        &self,
        chunk_id: &str,
        embedding: &[f32],
    ) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE chunks SET embedding = ?2 WHERE id = ?1",
            params![chunk_id, serde_json::to_string(embedding)?],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "chunk",
                id: chunk_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn insert_image(&self, image: &ImageRecord) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO images (id, document_id, page, bytes_path, analysis, relevance)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                image.id,
                image.document_id,
                image.page,
                image.bytes_path,
                image
                    .analysis
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                image.relevance,
            ],
        )?;
        Ok(())
    }

    /// Images for a document ordered by descending relevance.
    pub fn top_images(&self, document_id: &str, limit: usize) -> Result<Vec<ImageRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, document_id, page, bytes_path, analysis, relevance
             FROM images WHERE document_id = ?1
             ORDER BY relevance DESC, id LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![document_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, f64>(5)?,
            ))
        })?;
        let mut images = Vec::new();
        for row in rows {
            let (id, document_id, page, bytes_path, analysis, relevance) = row?;
            images.push(ImageRecord {
                id,
                document_id,
                page,
                bytes_path,
                analysis: analysis.map(|raw| serde_json::from_str(&raw)).transpose()?,
                relevance,
            });
        }
        Ok(images)
    }

    /// Every image of a document, page order.
    pub fn images_for_document(&self, document_id: &str) -> Result<Vec<ImageRecord>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, document_id, page, bytes_path, analysis, relevance
             FROM images WHERE document_id = ?1 ORDER BY page, id",
        )?;
        let rows = stmt.query_map(params![document_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, f64>(5)?,
            ))
        })?;
        let mut images = Vec::new();
        for row in rows {
            let (id, document_id, page, bytes_path, analysis, relevance) = row?;
            images.push(ImageRecord {
                id,
                document_id,
                page,
                bytes_path,
                analysis: analysis.map(|raw| serde_json::from_str(&raw)).transpose()?,
                relevance,
            });
        }
        Ok(images)
    }

    pub fn update_image_analysis(
        &self,
        image_id: &str,
        analysis: &crate::schemas::ImageAnalysis,
        relevance: f64,
    ) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE images SET analysis = ?2, relevance = ?3 WHERE id = ?1",
            params![image_id, serde_json::to_string(analysis)?, relevance],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound {
                entity: "image",
                id: image_id.to_string(),
            });
        }
        Ok(())
    }

    // ── Gap analyses ──────────────────────────────────────────────────

    pub fn insert_gap_analysis(
        &self,
        chapter_id: Uuid,
        report: &GapReport,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO gap_analyses (chapter_id, score, report, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                chapter_id.to_string(),
                report.completeness,
                serde_json::to_string(report)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ChapterStatus, QualityScores, StagePayload};

    fn sample_chapter() -> Chapter {
        Chapter::new("user-1", "Glioblastoma surgical management")
    }

    #[test]
    fn chapter_round_trips_structurally() {
        let store = ChapterStore::new_in_memory().unwrap();
        let mut chapter = sample_chapter();
        chapter.stage_payloads.insert(
            StageId::QaScoring,
            StagePayload::QaScoring(QualityScores {
                depth: 0.8,
                coverage: 0.9,
                evidence: 0.75,
                currency: 0.6,
            }),
        );
        store.create_chapter(&chapter).unwrap();
        let loaded = store.get_chapter(chapter.id).unwrap().unwrap();
        assert_eq!(loaded.id, chapter.id);
        assert_eq!(loaded.topic, chapter.topic);
        assert_eq!(loaded.stage_payloads.len(), 1);
        assert_eq!(
            serde_json::to_value(&loaded).unwrap(),
            serde_json::to_value(&chapter).unwrap()
        );
    }

    #[test]
    fn missing_chapter_reads_as_none() {
        let store = ChapterStore::new_in_memory().unwrap();
        assert!(store.get_chapter(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn save_rejects_stage_regression() {
        let store = ChapterStore::new_in_memory().unwrap();
        let mut chapter = sample_chapter();
        store.create_chapter(&chapter).unwrap();

        chapter.current_stage = StageId::SynthesisPlan;
        store.save_chapter(&chapter).unwrap();

        chapter.current_stage = StageId::Context;
        let err = store.save_chapter(&chapter).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn save_unknown_chapter_is_not_found() {
        let store = ChapterStore::new_in_memory().unwrap();
        let chapter = sample_chapter();
        let err = store.save_chapter(&chapter).unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[test]
    fn exactly_one_version_is_current() {
        let mut store = ChapterStore::new_in_memory().unwrap();
        let mut chapter = sample_chapter();
        store.create_chapter(&chapter).unwrap();
        chapter.status = ChapterStatus::Completed;

        for v in 1..=3u32 {
            store
                .create_version(&ChapterVersion {
                    chapter_id: chapter.id,
                    version: v,
                    title: chapter.title.clone(),
                    sections: vec![],
                    summary: None,
                    is_current: true,
                    created_by: "user-1".to_string(),
                    created_at: Utc::now(),
                })
                .unwrap();
        }

        let versions = store.list_versions(chapter.id).unwrap();
        assert_eq!(versions.len(), 3);
        let current: Vec<u32> = versions
            .iter()
            .filter(|v| v.is_current)
            .map(|v| v.version)
            .collect();
        assert_eq!(current, vec![3]);
    }

    #[test]
    fn committed_chunks_excludes_uncommitted_documents() {
        let store = ChapterStore::new_in_memory().unwrap();
        for (doc_id, status) in [("doc-a", DocumentStatus::Committed), ("doc-b", DocumentStatus::Processing)] {
            store
                .insert_document(&Document {
                    id: doc_id.to_string(),
                    title: format!("{doc_id} title"),
                    authors: vec!["Author".to_string()],
                    year: Some(2022),
                    status,
                    citations: vec![],
                    created_at: Utc::now(),
                })
                .unwrap();
            store
                .insert_chunk(&Chunk {
                    id: format!("{doc_id}-c0"),
                    document_id: doc_id.to_string(),
                    page: 1,
                    content: "dural opening technique".to_string(),
                    embedding: vec![0.1, 0.2, 0.3],
                })
                .unwrap();
        }

        let chunks = store.committed_chunks().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].document_id, "doc-a");

        store
            .set_document_status("doc-b", DocumentStatus::Committed)
            .unwrap();
        assert_eq!(store.committed_chunks().unwrap().len(), 2);
    }

    #[test]
    fn top_images_orders_by_relevance() {
        let store = ChapterStore::new_in_memory().unwrap();
        store
            .insert_document(&Document {
                id: "doc-a".to_string(),
                title: "Atlas".to_string(),
                authors: vec![],
                year: None,
                status: DocumentStatus::Committed,
                citations: vec![],
                created_at: Utc::now(),
            })
            .unwrap();
        for (id, relevance) in [("img-low", 0.2), ("img-high", 0.9), ("img-mid", 0.5)] {
            store
                .insert_image(&ImageRecord {
                    id: id.to_string(),
                    document_id: "doc-a".to_string(),
                    page: 1,
                    bytes_path: format!("/blobs/{id}"),
                    analysis: None,
                    relevance,
                })
                .unwrap();
        }
        let images = store.top_images("doc-a", 2).unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0].id, "img-high");
        assert_eq!(images[1].id, "img-mid");
    }
}
