// Path rules for material written to local storage.

mod normalize;

pub use normalize::{bundle_entry_path, storage_segment, PathError, MAX_PATH_CHARS};
