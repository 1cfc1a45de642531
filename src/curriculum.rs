//! The curriculum hierarchy: grades → subjects → lessons → topics.
//!
//! Every level is ordered among its siblings by `order_index`, starting at 0.

use serde::{Deserialize, Serialize};

#[cfg(feature = "postgres")]
use crate::traits::PgQuery;
use crate::registry::InvalidationRegistry;
use crate::scope::OrderedTable;
use crate::traits::NewRow;

pub const GRADES: OrderedTable = OrderedTable::new("grades");
pub const SUBJECTS: OrderedTable = OrderedTable::new("subjects").scoped_by("grade_id");
pub const LESSONS: OrderedTable = OrderedTable::new("lessons").scoped_by("subject_id");
pub const TOPICS: OrderedTable = OrderedTable::new("topics").scoped_by("lesson_id");

/// All curriculum tables, parents first.
pub const CURRICULUM_TABLES: [OrderedTable; 4] = [GRADES, SUBJECTS, LESSONS, TOPICS];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewGrade {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewSubject {
    pub name: String,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLesson {
    pub name: String,
    pub icon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTopic {
    pub name: String,
    /// Client-rendered content description
    pub component: Option<serde_json::Value>,
}

impl NewRow for NewGrade {
    fn columns(&self) -> &'static [&'static str] {
        &["name"]
    }

    #[cfg(feature = "postgres")]
    fn bind<'q>(&'q self, query: PgQuery<'q>) -> PgQuery<'q> {
        query.bind(self.name.as_str())
    }
}

impl NewRow for NewSubject {
    fn columns(&self) -> &'static [&'static str] {
        &["name", "icon"]
    }

    #[cfg(feature = "postgres")]
    fn bind<'q>(&'q self, query: PgQuery<'q>) -> PgQuery<'q> {
        query.bind(self.name.as_str()).bind(self.icon.as_deref())
    }
}

impl NewRow for NewLesson {
    fn columns(&self) -> &'static [&'static str] {
        &["name", "icon"]
    }

    #[cfg(feature = "postgres")]
    fn bind<'q>(&'q self, query: PgQuery<'q>) -> PgQuery<'q> {
        query.bind(self.name.as_str()).bind(self.icon.as_deref())
    }
}

impl NewRow for NewTopic {
    fn columns(&self) -> &'static [&'static str] {
        &["name", "component"]
    }

    #[cfg(feature = "postgres")]
    fn bind<'q>(&'q self, query: PgQuery<'q>) -> PgQuery<'q> {
        query.bind(self.name.as_str()).bind(self.component.clone())
    }
}

/// Cached views of the curriculum, keyed by the table whose writes make
/// them stale.
///
/// `curriculums` holds the whole nested tree, so any write invalidates it.
pub fn curriculum_registry() -> InvalidationRegistry {
    InvalidationRegistry::new()
        .with(GRADES.name, "curriculums")
        .with(GRADES.name, "grades")
        .with(SUBJECTS.name, "curriculums")
        .with(SUBJECTS.name, "subjects:{grade_id}")
        .with(SUBJECTS.name, "subject:{id}")
        .with(LESSONS.name, "curriculums")
        .with(LESSONS.name, "lessons:{subject_id}")
        .with(LESSONS.name, "lesson:{id}")
        .with(TOPICS.name, "curriculums")
        .with(TOPICS.name, "topics:{lesson_id}")
        .with(TOPICS.name, "topic:{id}")
}
