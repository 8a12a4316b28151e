use std::io;

/// Failure to obtain memory for a heap page.
#[derive(Debug, thiserror::Error)]
pub enum PageError {
    #[error("failed to map {size} bytes for a heap page")]
    Map {
        size: usize,
        #[source]
        source: io::Error,
    },
    #[error("page of {cells} cells does not fit in the address space")]
    SizeOverflow { cells: usize },
}
