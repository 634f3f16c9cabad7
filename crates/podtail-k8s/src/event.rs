use podtail_types::PodRecord;

/// Typed watch event as seen by the registry.
///
/// Bookmarks advance the resource-version cursor without carrying a
/// pod; everything else carries the decoded record.
#[derive(Clone, Debug)]
pub enum PodWatchEvent {
    Added(PodRecord),
    Modified(PodRecord),
    Deleted(PodRecord),
    Bookmark { resource_version: String },
}
