use std::sync::atomic::{AtomicU8, Ordering};

/// Readiness bits for the components that must be up before the service takes traffic.
///
/// The readiness probe answers 200 only once every component has reported in.
static READY_COMPONENTS: AtomicU8 = AtomicU8::new(0);

/// Component reporting readiness
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    SchemaCatalog,
    RequestLog,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::SchemaCatalog => "schema catalog",
            Component::RequestLog => "request log",
        }
    }

    fn bit(&self) -> u8 {
        match self {
            Component::SchemaCatalog => 0b01,
            Component::RequestLog => 0b10,
        }
    }
}

const ALL_COMPONENTS: u8 = 0b11;

/// Mark one component as ready.
pub fn mark_ready(component: Component) {
    READY_COMPONENTS.fetch_or(component.bit(), Ordering::SeqCst);
    log::info!("{} is ready", component.as_str());
}

/// True once every component has been marked ready.
pub fn is_ready() -> bool {
    READY_COMPONENTS.load(Ordering::SeqCst) == ALL_COMPONENTS
}

/// Components that have not reported in yet.
pub fn pending() -> Vec<Component> {
    let bits = READY_COMPONENTS.load(Ordering::SeqCst);
    [Component::SchemaCatalog, Component::RequestLog]
        .into_iter()
        .filter(|c| bits & c.bit() == 0)
        .collect()
}

/// Reset readiness status (useful for testing)
#[allow(dead_code)]
pub fn reset() {
    READY_COMPONENTS.store(0, Ordering::SeqCst);
    log::debug!("Readiness status reset");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    // Readiness is process-wide; tests touching it must not interleave.
    pub(crate) static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_initial_state_not_ready() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        assert!(!is_ready());
        assert_eq!(pending().len(), 2);
    }

    #[test]
    fn test_ready_needs_every_component() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        mark_ready(Component::SchemaCatalog);
        assert!(!is_ready());
        assert_eq!(pending(), vec![Component::RequestLog]);
        mark_ready(Component::RequestLog);
        assert!(is_ready());
    }

    #[test]
    fn test_multiple_marks_stay_ready() {
        let _guard = TEST_LOCK.lock().unwrap();
        reset();
        mark_ready(Component::RequestLog);
        mark_ready(Component::SchemaCatalog);
        mark_ready(Component::RequestLog);
        assert!(is_ready());
        assert!(pending().is_empty());
    }
}
