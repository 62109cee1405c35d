use std::{
    fmt,
    future::Future,
    ops::Deref,
    sync::{
        atomic::{AtomicUsize, Ordering::Relaxed},
        Arc,
    },
};

use tracing::{debug_span, instrument::Instrumented, Instrument as _};

static GLOBAL_PROCESS_ID_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Process identifier.
///
/// A simple, numeric identifier that uniquely identifies one incarnation of a process. A restarted child gets a new
/// identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Id(usize);

impl Id {
    fn next() -> Self {
        Self(GLOBAL_PROCESS_ID_COUNTER.fetch_add(1, Relaxed))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process name.
///
/// Names are scoped: a child named `sel_logger` under a supervisor named `bmcd` is called `bmcd.sel_logger`. Each
/// segment is sanitized so it only contains alphanumeric characters separated by single underscores, which keeps
/// names usable as metric labels and log fields regardless of what a service calls itself.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Name(Arc<str>);

impl Name {
    pub(crate) fn root<N: AsRef<str>>(name: N) -> Option<Self> {
        sanitize_segment(name.as_ref()).map(|segment| Self(segment.into()))
    }

    pub(crate) fn scoped<N: AsRef<str>>(parent: &Name, name: N) -> Option<Self> {
        sanitize_segment(name.as_ref()).map(|segment| Self(format!("{}.{}", parent.0, segment).into()))
    }
}

impl Deref for Name {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Returns `true` if `name` can be used as a process name.
pub(crate) fn is_valid_name(name: &str) -> bool {
    sanitize_segment(name).is_some()
}

/// Reduces a name segment to alphanumeric runs joined by single underscores.
///
/// Returns `None` if nothing alphanumeric remains.
fn sanitize_segment(raw: &str) -> Option<String> {
    let segment = raw
        .split(|c: char| !c.is_alphanumeric())
        .filter(|run| !run.is_empty())
        .collect::<Vec<_>>()
        .join("_");

    (!segment.is_empty()).then_some(segment)
}

/// A runtime process: either a supervisor or one incarnation of a supervised child.
#[derive(Clone, Debug)]
pub struct Process {
    id: Id,
    name: Name,
    generation: usize,
}

impl Process {
    pub(crate) fn supervisor<N: AsRef<str>>(name: N) -> Option<Self> {
        Name::root(name).map(|name| Self {
            id: Id::next(),
            name,
            generation: 0,
        })
    }

    /// Creates the process for a child of `parent`.
    ///
    /// `generation` counts how many times the child has been restarted.
    pub(crate) fn worker<N: AsRef<str>>(name: N, parent: &Process, generation: usize) -> Option<Self> {
        Name::scoped(&parent.name, name).map(|name| Self {
            id: Id::next(),
            name,
            generation,
        })
    }

    /// Returns the process identifier.
    pub fn id(&self) -> Id {
        self.id
    }

    /// Returns the scoped process name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wraps `inner` in a `process` span carrying this process's identity.
    pub fn instrument<F: Future>(&self, inner: F) -> Instrumented<F> {
        let span = debug_span!(
            "process",
            process_id = self.id.0,
            process_name = &*self.name,
            generation = self.generation,
        );
        inner.instrument(span)
    }
}
