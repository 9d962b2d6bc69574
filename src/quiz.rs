use std::future::Future;

use serde_json::Value;

use crate::{
    error::PortalError,
    local_store::{LocalStore, LOCAL_QUIZZES_KEY},
    models::{Quiz, QuizCatalog},
};

/// Read-only catalog published alongside the site.
pub trait CatalogSource: Send + Sync {
    fn fetch_catalog(&self) -> impl Future<Output = Result<Vec<Quiz>, PortalError>> + Send;
}

#[derive(Clone)]
pub struct HttpCatalog {
    http: reqwest::Client,
    url: String,
}

impl HttpCatalog {
    pub fn with_client(http: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }
}

impl CatalogSource for HttpCatalog {
    async fn fetch_catalog(&self) -> Result<Vec<Quiz>, PortalError> {
        let resp = self.http.get(&self.url).send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(PortalError::Transport(format!(
                "GET {} returned {}",
                self.url, status
            )));
        }

        let catalog: QuizCatalog = resp.json().await?;
        Ok(decode_quizzes(catalog.quizzes, "static"))
    }
}

/// Decodes each entry on its own; entries that don't fit `Quiz` are logged
/// and skipped.
fn decode_quizzes(entries: Vec<Value>, source: &'static str) -> Vec<Quiz> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let id = entry_id(&entry);
            serde_json::from_value(entry)
                .map_err(|e| {
                    tracing::warn!(source, id = ?id, error = %e, "Skipping malformed quiz entry");
                })
                .ok()
        })
        .collect()
}

fn entry_id(entry: &Value) -> Option<String> {
    match entry.get("id")? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Admin-authored quizzes kept as a JSON array under the `"quizzes"` key.
pub struct LocalQuizCatalog<L> {
    store: L,
}

impl<L: LocalStore> LocalQuizCatalog<L> {
    pub fn new(store: L) -> Self {
        Self { store }
    }

    /// Stored quizzes; a missing or unreadable slot reads as empty.
    pub fn load(&self) -> Vec<Quiz> {
        match self.entries() {
            Ok(entries) => decode_quizzes(entries, "local"),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring malformed local quiz catalog");
                Vec::new()
            }
        }
    }

    /// Raw slot contents. Edits go through these so entries that no longer
    /// decode are written back untouched.
    fn entries(&self) -> Result<Vec<Value>, PortalError> {
        match self.store.get(LOCAL_QUIZZES_KEY) {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    pub fn find(&self, id: &str) -> Option<Quiz> {
        self.load().into_iter().find(|q| q.id == id)
    }

    /// Replaces the quiz with the same id, or appends it. Fails without
    /// writing when the slot is not a JSON array.
    pub fn save(&self, quiz: Quiz) -> Result<(), PortalError> {
        let mut entries = self.entries()?;
        let value = serde_json::to_value(&quiz)?;
        match entries
            .iter_mut()
            .find(|entry| entry_id(entry).as_deref() == Some(quiz.id.as_str()))
        {
            Some(existing) => *existing = value,
            None => entries.push(value),
        }
        self.write(&entries)
    }

    /// Returns whether a quiz with `id` was there to remove.
    pub fn remove(&self, id: &str) -> Result<bool, PortalError> {
        let mut entries = self.entries()?;
        let before = entries.len();
        entries.retain(|entry| entry_id(entry).as_deref() != Some(id));
        if entries.len() == before {
            return Ok(false);
        }
        self.write(&entries)?;
        Ok(true)
    }

    fn write(&self, entries: &[Value]) -> Result<(), PortalError> {
        let raw = serde_json::to_string(entries)?;
        self.store.set(LOCAL_QUIZZES_KEY, &raw)
    }
}

/// Looks quizzes up in the static catalog first, then the local one.
pub struct QuizResolver<C, L> {
    catalog: C,
    local: LocalQuizCatalog<L>,
}

impl<C: CatalogSource, L: LocalStore> QuizResolver<C, L> {
    pub fn new(catalog: C, store: L) -> Self {
        Self {
            catalog,
            local: LocalQuizCatalog::new(store),
        }
    }

    pub fn local(&self) -> &LocalQuizCatalog<L> {
        &self.local
    }

    async fn static_quizzes(&self) -> Vec<Quiz> {
        match self.catalog.fetch_catalog().await {
            Ok(quizzes) => quizzes,
            Err(e) => {
                tracing::warn!(error = %e, "Static quiz catalog unavailable; treating as empty");
                Vec::new()
            }
        }
    }

    pub async fn get_by_id(&self, id: &str) -> Option<Quiz> {
        if let Some(quiz) = self.static_quizzes().await.into_iter().find(|q| q.id == id) {
            return Some(quiz);
        }
        self.local.find(id)
    }

    /// Every quiz, static ones first; local entries shadowed by a static id
    /// are left out.
    pub async fn all(&self) -> Vec<Quiz> {
        let mut quizzes = self.static_quizzes().await;
        for quiz in self.local.load() {
            if !quizzes.iter().any(|q| q.id == quiz.id) {
                quizzes.push(quiz);
            }
        }
        quizzes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{local_store::MemoryStore, models::sample_quiz};
    use std::sync::Arc;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    struct FixedCatalog(Result<Vec<Quiz>, &'static str>);

    impl CatalogSource for FixedCatalog {
        async fn fetch_catalog(&self) -> Result<Vec<Quiz>, PortalError> {
            self.0
                .clone()
                .map_err(|e| PortalError::Transport(e.to_string()))
        }
    }

    fn store_with_local(quizzes: &[Quiz]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .set(LOCAL_QUIZZES_KEY, &serde_json::to_string(quizzes).unwrap())
            .unwrap();
        store
    }

    /// Answers a single HTTP request with `status` and `body`.
    async fn serve_once(status: &'static str, body: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/data/quizzes.json")
    }

    fn direct_catalog(url: String) -> HttpCatalog {
        let http = reqwest::Client::builder().no_proxy().build().unwrap();
        HttpCatalog::with_client(http, url)
    }

    #[tokio::test]
    async fn static_catalog_wins_over_local() {
        let store = store_with_local(&[sample_quiz("q1", "Local Algebra")]);
        let resolver = QuizResolver::new(
            FixedCatalog(Ok(vec![sample_quiz("q1", "Static Algebra")])),
            store,
        );

        let quiz = resolver.get_by_id("q1").await.unwrap();
        assert_eq!(quiz.title, "Static Algebra");
    }

    #[tokio::test]
    async fn falls_back_to_local_catalog() {
        let store = store_with_local(&[sample_quiz("q2", "Teacher Quiz")]);
        let resolver = QuizResolver::new(
            FixedCatalog(Ok(vec![sample_quiz("q1", "Static Algebra")])),
            store,
        );

        assert_eq!(resolver.get_by_id("q2").await.unwrap().title, "Teacher Quiz");
    }

    #[tokio::test]
    async fn unknown_id_is_absent() {
        let store = store_with_local(&[sample_quiz("q2", "Teacher Quiz")]);
        let resolver = QuizResolver::new(
            FixedCatalog(Ok(vec![sample_quiz("q1", "Static Algebra")])),
            store,
        );

        assert_eq!(resolver.get_by_id("q404").await, None);
    }

    #[tokio::test]
    async fn malformed_local_catalog_reads_as_empty() {
        let store = Arc::new(MemoryStore::new());
        store.set(LOCAL_QUIZZES_KEY, "{not: valid json").unwrap();
        let resolver = QuizResolver::new(FixedCatalog(Ok(Vec::new())), Arc::clone(&store));

        assert_eq!(resolver.get_by_id("q1").await, None);
        assert!(resolver.all().await.is_empty());
    }

    #[tokio::test]
    async fn catalog_failure_still_finds_local_quizzes() {
        let store = store_with_local(&[sample_quiz("q2", "Teacher Quiz")]);
        let resolver = QuizResolver::new(FixedCatalog(Err("connection refused")), store);

        assert_eq!(resolver.get_by_id("q2").await.unwrap().title, "Teacher Quiz");
        assert_eq!(resolver.get_by_id("q1").await, None);
    }

    #[tokio::test]
    async fn listing_skips_shadowed_local_entries() {
        let store = store_with_local(&[
            sample_quiz("q1", "Local Algebra"),
            sample_quiz("q3", "Local Geometry"),
        ]);
        let resolver = QuizResolver::new(
            FixedCatalog(Ok(vec![sample_quiz("q1", "Static Algebra")])),
            store,
        );

        let titles: Vec<String> = resolver.all().await.into_iter().map(|q| q.title).collect();
        assert_eq!(titles, vec!["Static Algebra", "Local Geometry"]);
    }

    #[test]
    fn save_replaces_by_id_and_remove_reports() {
        let catalog = LocalQuizCatalog::new(MemoryStore::new());
        catalog.save(sample_quiz("q1", "Draft")).unwrap();
        catalog.save(sample_quiz("q2", "Other")).unwrap();
        catalog.save(sample_quiz("q1", "Final")).unwrap();

        let quizzes = catalog.load();
        assert_eq!(quizzes.len(), 2);
        assert_eq!(catalog.find("q1").unwrap().title, "Final");

        assert!(catalog.remove("q1").unwrap());
        assert!(!catalog.remove("q1").unwrap());
        assert_eq!(catalog.load().len(), 1);
    }

    #[test]
    fn bad_local_entry_is_skipped_and_kept_on_save() {
        let store = Arc::new(MemoryStore::new());
        let slot = serde_json::json!([
            serde_json::to_value(sample_quiz("q1", "Algebra")).unwrap(),
            {"id": "q2", "title": "Imported", "type": "mcq", "timer": "300", "questionCount": 4}
        ]);
        store.set(LOCAL_QUIZZES_KEY, &slot.to_string()).unwrap();
        let catalog = LocalQuizCatalog::new(Arc::clone(&store));

        assert_eq!(catalog.find("q1").unwrap().title, "Algebra");
        assert_eq!(catalog.find("q2"), None);

        catalog.save(sample_quiz("q9", "New")).unwrap();
        let raw: Vec<Value> =
            serde_json::from_str(&store.get(LOCAL_QUIZZES_KEY).unwrap()).unwrap();
        let ids: Vec<_> = raw.iter().filter_map(entry_id).collect();
        assert_eq!(ids, vec!["q1", "q2", "q9"]);
        assert_eq!(raw[1]["timer"], "300");
    }

    #[test]
    fn unreadable_slot_is_not_overwritten() {
        let store = Arc::new(MemoryStore::new());
        store.set(LOCAL_QUIZZES_KEY, "{not: valid json").unwrap();
        let catalog = LocalQuizCatalog::new(Arc::clone(&store));

        let err = catalog.save(sample_quiz("q9", "New")).unwrap_err();
        assert!(matches!(err, PortalError::MalformedLocalData(_)));
        assert!(catalog.remove("q9").is_err());
        assert_eq!(store.get(LOCAL_QUIZZES_KEY).as_deref(), Some("{not: valid json"));
    }

    #[tokio::test]
    async fn http_catalog_reads_quizzes_field() {
        let body = serde_json::json!({
            "quizzes": [
                {"id": 1, "title": "Photosynthesis", "type": "mcq", "timer": 900, "questionCount": 12}
            ]
        })
        .to_string();
        let url = serve_once("200 OK", body).await;

        let quizzes = direct_catalog(url).fetch_catalog().await.unwrap();
        assert_eq!(quizzes.len(), 1);
        assert_eq!(quizzes[0].id, "1");
        assert_eq!(quizzes[0].question_count, 12);
    }

    #[tokio::test]
    async fn http_catalog_skips_malformed_entries() {
        let body = serde_json::json!({
            "quizzes": [
                {"id": 1, "title": "Photosynthesis", "type": "mcq", "timer": 900, "questionCount": 12},
                {"id": 2, "type": "mcq", "timer": 600, "questionCount": 8},
                {"id": "q3", "title": "Cells", "type": "mcq", "timer": 300, "questionCount": 5}
            ]
        })
        .to_string();
        let url = serve_once("200 OK", body).await;

        let quizzes = direct_catalog(url).fetch_catalog().await.unwrap();
        let ids: Vec<_> = quizzes.iter().map(|q| q.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "q3"]);
    }

    #[tokio::test]
    async fn http_error_status_is_a_transport_failure() {
        let url = serve_once("404 Not Found", "{}".to_string()).await;
        let err = direct_catalog(url).fetch_catalog().await.unwrap_err();
        assert!(matches!(err, PortalError::Transport(_)));
    }

    #[tokio::test]
    async fn http_failure_degrades_to_local_catalog() {
        let url = serve_once("500 Internal Server Error", "oops".to_string()).await;
        let store = store_with_local(&[sample_quiz("q2", "Teacher Quiz")]);
        let resolver = QuizResolver::new(direct_catalog(url), store);

        assert_eq!(resolver.get_by_id("q2").await.unwrap().title, "Teacher Quiz");
    }
}
