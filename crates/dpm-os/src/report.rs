use std::sync::{Arc, PoisonError, RwLock};

use dpm::error::{DmError, Result};

use tracing::error;

/// The callback receiving every error, with its catalogue code and message.
pub type ErrorCallback = Arc<dyn Fn(u8, &str) + Send + Sync>;

// Second channel of every error, next to the returned `Result`.
#[derive(Clone, Default)]
pub(crate) struct ErrorReporter {
    callback: Arc<RwLock<Option<ErrorCallback>>>,
}

impl std::fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl ErrorReporter {
    pub(crate) fn set(&self, callback: Option<ErrorCallback>) {
        *self
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = callback;
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub(crate) fn report(&self, context: &str, error: &DmError) {
        error!("{context}: {error} (code {:#04x})", error.code());

        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(error.code(), &format!("{context}: {error}"));
        }
    }

    // Reports the error, if any, and hands the result back.
    pub(crate) fn check<T>(&self, context: &str, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.report(context, e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn both_channels() {
        let reporter = ErrorReporter::default();
        let received = Arc::new(Mutex::new(Vec::new()));

        // Nothing registered yet.
        let result: Result<()> = reporter.check("Session `1`", Err(DmError::NetDown));
        assert_eq!(result, Err(DmError::NetDown));

        let sink = received.clone();
        reporter.set(Some(Arc::new(move |code: u8, message: &str| {
            sink.lock().unwrap().push((code, message.to_owned()));
        })));
        assert!(reporter.is_registered());

        let result = reporter.check("Session `1`", Err::<(), _>(DmError::BindFail(9000)));
        assert_eq!(result, Err(DmError::BindFail(9000)));
        assert_eq!(reporter.check("Session `1`", Ok(3)), Ok(3));

        let received = received.lock().unwrap();
        assert_eq!(
            *received,
            vec![(0x0F, "Session `1`: Bind failed on port 9000".to_owned())]
        );
    }
}
