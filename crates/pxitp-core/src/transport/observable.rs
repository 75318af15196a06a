//! Transport wrapper that emits report events.

use std::sync::Arc;

use super::traits::{HidTransport, TransportError};
use crate::events::{ReportDirection, UpdateEvent, UpdateObserver};

pub struct ObservableTransport<T: HidTransport, O: UpdateObserver> {
    inner: T,
    observer: Arc<O>,
}

impl<T: HidTransport, O: UpdateObserver> ObservableTransport<T, O> {
    pub fn new(inner: T, observer: Arc<O>) -> Self {
        Self { inner, observer }
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }
}

impl<T: HidTransport, O: UpdateObserver> HidTransport for ObservableTransport<T, O> {
    fn set_feature(&self, data: &[u8]) -> Result<(), TransportError> {
        let res = self.inner.set_feature(data);
        if res.is_ok() {
            self.observer.on_event(&UpdateEvent::Report {
                direction: ReportDirection::Set,
                report_id: data.first().copied().unwrap_or(0),
                length: data.len(),
            });
        }
        res
    }

    fn get_feature(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        let res = self.inner.get_feature(buf);
        if let Ok(n) = &res {
            self.observer.on_event(&UpdateEvent::Report {
                direction: ReportDirection::Get,
                report_id: buf.first().copied().unwrap_or(0),
                length: *n,
            });
        }
        res
    }

    fn rebind(&self) -> Result<(), TransportError> {
        self.inner.rebind()
    }

    fn name(&self) -> String {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingObserver;
    use crate::transport::MockTransport;

    #[test]
    fn test_reports_are_observed() {
        let observer = Arc::new(RecordingObserver::new());
        let transport = ObservableTransport::new(MockTransport::new(), observer.clone());

        transport.set_feature(&[0x43, 0x0b, 0x10, 0x00]).unwrap();
        let mut buf = [0x43, 0, 0, 0];
        transport.get_feature(&mut buf).unwrap();

        let events = observer.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            UpdateEvent::Report {
                direction: ReportDirection::Set,
                report_id: 0x43,
                length: 4
            }
        ));
        assert!(matches!(
            events[1],
            UpdateEvent::Report {
                direction: ReportDirection::Get,
                ..
            }
        ));
    }

    #[test]
    fn test_failed_set_is_not_observed() {
        let observer = Arc::new(RecordingObserver::new());
        let mock = MockTransport::new();
        mock.device().fail_after_sets = Some(0);
        let transport = ObservableTransport::new(mock, observer.clone());

        assert!(transport.set_feature(&[0x42, 0, 0, 0]).is_err());
        assert!(observer.events().is_empty());
    }
}
