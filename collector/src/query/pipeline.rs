use mongodb::bson::{doc, Bson, Document};

/// One aggregation stage. Stored documents wrap their records in a `results`
/// array, so most pipelines start by unwinding `$results`.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Unwind(String),
    Match(Document),
    Group(Document),
    Sort(Document),
    Project(Document),
    ReplaceRoot(Bson),
}

impl Stage {
    pub fn into_document(self) -> Document {
        match self {
            Stage::Unwind(path) => doc! {"$unwind": path},
            Stage::Match(conditions) => doc! {"$match": conditions},
            Stage::Group(spec) => doc! {"$group": spec},
            Stage::Sort(spec) => doc! {"$sort": spec},
            Stage::Project(spec) => doc! {"$project": spec},
            Stage::ReplaceRoot(new_root) => doc! {"$replaceRoot": {"newRoot": new_root}},
        }
    }
}

/// Builder holding at most one of each stage. `build` emits the supplied
/// stages in a fixed order (unwind, match, group, sort, project,
/// replace-root) regardless of the order the setters were called in;
/// omitted stages are absent from the pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineBuilder {
    unwind: Option<Stage>,
    filter: Option<Stage>,
    group: Option<Stage>,
    sort: Option<Stage>,
    project: Option<Stage>,
    replace_root: Option<Stage>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unwind(mut self, path: impl Into<String>) -> Self {
        self.unwind = Some(Stage::Unwind(path.into()));
        self
    }

    pub fn filter(mut self, conditions: Document) -> Self {
        self.filter = Some(Stage::Match(conditions));
        self
    }

    pub fn group(mut self, spec: Document) -> Self {
        self.group = Some(Stage::Group(spec));
        self
    }

    pub fn sort(mut self, spec: Document) -> Self {
        self.sort = Some(Stage::Sort(spec));
        self
    }

    pub fn project(mut self, spec: Document) -> Self {
        self.project = Some(Stage::Project(spec));
        self
    }

    pub fn replace_root(mut self, new_root: impl Into<Bson>) -> Self {
        self.replace_root = Some(Stage::ReplaceRoot(new_root.into()));
        self
    }

    pub fn build(self) -> Vec<Document> {
        [
            self.unwind,
            self.filter,
            self.group,
            self.sort,
            self.project,
            self.replace_root,
        ]
        .into_iter()
        .flatten()
        .map(Stage::into_document)
        .collect()
    }
}
