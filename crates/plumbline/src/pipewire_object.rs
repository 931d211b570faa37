//! Proxy behavior for server objects that publish info and parameters.

use tracing::trace;

use crate::error::SessionError;
use crate::flags::Features;
use crate::proxy::{execute_base_step, Proxy, ProxyImpl, STEP_BIND};
use crate::transition::{Step, Transition};

/// Waits for the first info event after binding.
pub const STEP_WAIT_INFO: Step = Step::Custom(2);
/// Enumerates every parameter and waits for the round trip.
pub const STEP_CACHE_PARAMS: Step = Step::Custom(3);

#[derive(Debug, Clone)]
pub struct PipewireObject {
    supported: Features,
}

impl PipewireObject {
    pub fn new(supported: Features) -> Self {
        Self {
            supported: supported | Features::BOUND,
        }
    }
}

impl ProxyImpl for PipewireObject {
    fn supported_features(&self) -> Features {
        self.supported
    }

    fn next_step(&self, proxy: &Proxy, _step: Step, missing: Features) -> Step {
        if !proxy.active_features().contains(Features::BOUND) {
            STEP_BIND
        } else if missing.contains(Features::INFO) {
            STEP_WAIT_INFO
        } else if missing.contains(Features::PARAMS) {
            STEP_CACHE_PARAMS
        } else {
            Step::Error
        }
    }

    fn execute_step(&self, proxy: &Proxy, transition: &Transition, step: Step, _missing: Features) {
        match step {
            // info follows the bind acknowledgement on its own
            s if s == STEP_WAIT_INFO => {}
            s if s == STEP_CACHE_PARAMS => cache_params(proxy, transition),
            _ => execute_base_step(proxy, transition, step),
        }
    }

    fn deactivate(&self, proxy: &Proxy, features: Features) {
        if features.contains(Features::PARAMS) {
            trace!("{}: dropping cached params", proxy);
        }
    }
}

fn cache_params(proxy: &Proxy, transition: &Transition) {
    let (Some(core), Some(handle)) = (proxy.core(), proxy.handle()) else {
        transition.return_error(SessionError::Invariant(format!(
            "{proxy}: cannot cache params without a handle"
        )));
        return;
    };

    proxy.clear_params();
    if let Err(e) = core.remote().enum_params(handle) {
        transition.return_error(e);
        return;
    }

    let weak = proxy.downgrade();
    core.sync(move |_| {
        let Some(proxy) = weak.upgrade() else {
            return;
        };
        if proxy.handle() == Some(handle) {
            trace!("{}: cached {} params", proxy, proxy.params().len());
            proxy.update_features(Features::PARAMS, Features::empty());
        }
    });
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use serde_json::json;

    use super::*;
    use crate::core::Core;
    use crate::properties::Properties;
    use crate::remote::loopback::LoopbackRemote;
    use crate::type_registry::{interfaces, TypeRegistry};

    fn activate(proxy: &Proxy, features: Features) -> Rc<RefCell<Option<Result<(), SessionError>>>> {
        let slot = Rc::new(RefCell::new(None));
        let out = slot.clone();
        proxy.activate(features, move |_, result| *out.borrow_mut() = Some(result));
        slot
    }

    #[test]
    fn test_full_activation_caches_info_and_params() {
        let remote = LoopbackRemote::new();
        let core = Core::new(remote.clone(), TypeRegistry::with_defaults());
        let proxy = Proxy::from_factory(
            &core,
            "adapter",
            interfaces::NODE,
            [("media.class", "Audio/Sink")].into_iter().collect(),
        )
        .unwrap();

        let result = activate(&proxy, Features::BOUND);
        core.run_until_idle();
        assert_eq!(*result.borrow(), Some(Ok(())));

        let id = proxy.bound_id().unwrap();
        remote.add_param(id, 3, json!({"format": "S16LE"}));
        remote.add_param(id, 4, json!({"rate": 48000}));

        let result = activate(&proxy, Features::INFO | Features::PARAMS);
        core.run_until_idle();

        assert_eq!(*result.borrow(), Some(Ok(())));
        assert_eq!(
            proxy.active_features(),
            Features::BOUND | Features::INFO | Features::PARAMS
        );
        assert_eq!(
            proxy.info().and_then(|i| i.get("media.class").map(String::from)),
            Some("Audio/Sink".to_string())
        );
        assert_eq!(
            proxy.params(),
            vec![(3, json!({"format": "S16LE"})), (4, json!({"rate": 48000}))]
        );

        proxy.deactivate(Features::PARAMS);
        assert!(proxy.params().is_empty());
        assert_eq!(proxy.active_features(), Features::BOUND | Features::INFO);
    }

    #[test]
    fn test_waits_for_late_info() {
        let remote = LoopbackRemote::new();
        remote.set_send_info(false);
        let core = Core::new(remote.clone(), TypeRegistry::with_defaults());
        let id = remote.announce(interfaces::PORT, 3, Properties::new());
        core.run_until_idle();

        let global = core.global(id).unwrap();
        let entry = core.types().lookup(interfaces::PORT, 3).unwrap().clone();
        let proxy = Proxy::for_global(&core, &global, &entry);

        let result = activate(&proxy, Features::BOUND | Features::INFO);
        core.run_until_idle();
        assert!(result.borrow().is_none());
        assert_eq!(proxy.active_features(), Features::BOUND);

        let handle = proxy.handle().unwrap();
        core.handle_event(crate::remote::RemoteEvent::Info {
            handle,
            properties: [("port.name", "out_FL")].into_iter().collect(),
        });

        assert_eq!(*result.borrow(), Some(Ok(())));
        assert!(proxy.active_features().contains(Features::INFO));
    }
}
