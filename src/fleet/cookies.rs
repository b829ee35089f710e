use std::{
    fs,
    io,
    path::PathBuf,
    sync::{
        atomic::{AtomicU16, Ordering},
        Mutex,
    },
};

use data_model::{CookieKind, EdgeCookie, LevelCookie};
use tracing::warn;

/// Mirrors set cookies as marker files so they survive a restart.
///
/// Markers are written while holding `lock` together with the in-memory
/// update, so a marker never outlives a concurrent consume.
#[derive(Debug)]
pub struct CookieJournal {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl CookieJournal {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            lock: Mutex::new(()),
        }
    }

    fn marker(&self, kind: CookieKind) -> PathBuf {
        self.dir.join(format!("@cookie_{}", kind.name()))
    }

    fn touch(&self, kind: CookieKind) {
        let res = fs::create_dir_all(&self.dir).and_then(|_| fs::File::create(self.marker(kind)));
        if let Err(err) = res {
            warn!(
                dir = %self.dir.display(),
                cookie = kind.name(),
                "unable to write cookie marker: {:?}",
                err
            );
        }
    }

    fn remove(&self, kind: CookieKind) {
        match fs::remove_file(self.marker(kind)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                dir = %self.dir.display(),
                cookie = kind.name(),
                "unable to remove cookie marker: {:?}",
                err
            ),
        }
    }

    fn load(&self) -> u16 {
        CookieKind::all()
            .filter(|kind| self.marker(*kind).exists())
            .fold(0, |mask, kind| mask | kind.mask())
    }
}

/// Pending-action flags of one node.
///
/// All flags live in a single atomic mask. Consuming an edge cookie is one
/// `fetch_and`, so concurrent consumers of the same cookie observe exactly
/// one `true` per set.
#[derive(Debug, Default)]
pub struct CookieSet {
    mask: AtomicU16,
    journal: Option<CookieJournal>,
}

impl CookieSet {
    pub fn new(journal: Option<CookieJournal>) -> Self {
        let mask = journal.as_ref().map(|j| j.load()).unwrap_or_default();
        Self {
            mask: AtomicU16::new(mask),
            journal,
        }
    }

    /// Sets a cookie, re-arming it if it is an edge cookie. Returns true
    /// when the cookie was not already set.
    pub fn set(&self, kind: impl Into<CookieKind>) -> bool {
        let kind = kind.into();
        let Some(journal) = &self.journal else {
            return self.mask.fetch_or(kind.mask(), Ordering::AcqRel) & kind.mask() == 0;
        };
        let _guard = journal.lock.lock().unwrap_or_else(|e| e.into_inner());
        let previous = self.mask.fetch_or(kind.mask(), Ordering::AcqRel);
        journal.touch(kind);
        previous & kind.mask() == 0
    }

    pub fn has(&self, kind: LevelCookie) -> bool {
        let kind = CookieKind::Level(kind);
        self.mask.load(Ordering::Acquire) & kind.mask() != 0
    }

    /// Atomically clears an edge cookie, returning whether it was set.
    pub fn consume(&self, kind: EdgeCookie) -> bool {
        self.take(CookieKind::Edge(kind))
    }

    /// Clears a level cookie once its action is confirmed applied.
    pub fn clear(&self, kind: LevelCookie) -> bool {
        self.take(CookieKind::Level(kind))
    }

    fn take(&self, kind: CookieKind) -> bool {
        let Some(journal) = &self.journal else {
            return self.mask.fetch_and(!kind.mask(), Ordering::AcqRel) & kind.mask() != 0;
        };
        let _guard = journal.lock.lock().unwrap_or_else(|e| e.into_inner());
        let was_set = self.mask.fetch_and(!kind.mask(), Ordering::AcqRel) & kind.mask() != 0;
        if was_set {
            journal.remove(kind);
        }
        was_set
    }

    /// Cookies currently set. Does not consume anything.
    pub fn snapshot(&self) -> Vec<CookieKind> {
        let mask = self.mask.load(Ordering::Acquire);
        CookieKind::all()
            .filter(|kind| mask & kind.mask() != 0)
            .collect()
    }
}
