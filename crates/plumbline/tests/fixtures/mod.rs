#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use plumbline::{
    interfaces, Core, LoopbackRemote, ManagerEvent, ObjectManager, Properties, TypeRegistry,
};

pub struct TestFixture {
    pub remote: Rc<LoopbackRemote>,
    pub core: Core,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::with_types(TypeRegistry::with_defaults())
    }

    pub fn with_types(types: TypeRegistry) -> Self {
        let remote = LoopbackRemote::new();
        let core = Core::new(remote.clone(), types);
        Self { remote, core }
    }

    /// Process every queued remote event, including the ones processing
    /// produces.
    pub fn settle(&self) -> usize {
        self.core.run_until_idle()
    }

    pub fn announce_node(&self, id: u32, name: &str, media_class: &str) {
        self.remote.announce_at(
            id,
            interfaces::NODE,
            3,
            props(&[("node.name", name), ("media.class", media_class)]),
        );
    }

    pub fn install(&self, manager: &ObjectManager) -> EventLog {
        let log = EventLog::attach(manager);
        self.core.install_object_manager(manager);
        log
    }
}

pub fn props(pairs: &[(&str, &str)]) -> Properties {
    pairs.iter().copied().collect()
}

/// Manager events rendered as short strings, in emission order.
#[derive(Clone, Default)]
pub struct EventLog(Rc<RefCell<Vec<String>>>);

impl EventLog {
    pub fn attach(manager: &ObjectManager) -> Self {
        let log = Self::default();
        let out = log.clone();
        manager.connect(move |event| {
            let line = match event {
                ManagerEvent::ObjectAdded(o) => format!("added {o}"),
                ManagerEvent::ObjectRemoved(o) => format!("removed {o}"),
                ManagerEvent::ObjectsChanged => "changed".to_string(),
                ManagerEvent::Installed => "installed".to_string(),
            };
            out.0.borrow_mut().push(line);
        });
        log
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.borrow_mut())
    }

    pub fn count(&self, line: &str) -> usize {
        self.0.borrow().iter().filter(|l| l.as_str() == line).count()
    }
}
