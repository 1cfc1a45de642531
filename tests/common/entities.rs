use std::collections::HashMap;

use komplex_store::{InMemoryOrderBackend, NewLesson, OrderedRow, Reindexer, Scope, LESSONS};
use uuid::Uuid;

pub fn lesson(name: &str) -> NewLesson {
    NewLesson {
        name: name.to_string(),
        icon: None,
    }
}

/// The lesson scope of a fresh subject
pub fn lessons_under() -> Scope {
    LESSONS.scope(Some(Uuid::new_v4()))
}

/// A reindexer over `count` lessons of one subject, returning the backend
/// handle for direct inspection.
pub async fn seeded_lessons(
    count: usize,
) -> (Reindexer<InMemoryOrderBackend>, InMemoryOrderBackend, Scope, Vec<Uuid>) {
    let backend = InMemoryOrderBackend::new();
    let scope = lessons_under();
    let ids = backend.seed(&scope, count).await;
    (Reindexer::new(backend.clone()), backend, scope, ids)
}

pub fn ids(rows: &[OrderedRow]) -> Vec<Uuid> {
    rows.iter().map(|row| row.id).collect()
}

pub fn indices(rows: &[OrderedRow]) -> Vec<i32> {
    rows.iter().map(|row| row.order_index).collect()
}

/// Names rows A, B, C... so orderings read like the scenarios they test
#[derive(Default)]
pub struct Letters {
    names: HashMap<Uuid, String>,
}

impl Letters {
    pub fn new(ids: &[Uuid]) -> Self {
        let mut letters = Self::default();
        for (offset, id) in ids.iter().enumerate() {
            let name = char::from(b'A' + offset as u8).to_string();
            letters.name(*id, &name);
        }
        letters
    }

    pub fn name(&mut self, id: Uuid, name: &str) {
        self.names.insert(id, name.to_string());
    }

    pub fn render(&self, rows: &[OrderedRow]) -> Vec<String> {
        rows.iter()
            .map(|row| {
                let name = self.names.get(&row.id).map(String::as_str).unwrap_or("?");
                format!("{}({})", name, row.order_index)
            })
            .collect()
    }
}
