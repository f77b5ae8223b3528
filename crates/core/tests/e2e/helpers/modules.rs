//! Test modules.
//!
//! - `ShellTool` runs a shell script per event and turns `FOUND <x>` lines
//!   into FINDING events
//! - `Failing` always returns an error
//! - `Recorder` remembers every event it was given
//! - `Artifact` writes a file under its module directory
//! - `Relay` re-emits one kind as another
//! - `Stalled` never returns and ignores cancellation

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use reconhive_core::config::ModuleEntry;
use reconhive_core::error::ModuleError;
use reconhive_core::event::{Event, EventKind};
use reconhive_core::module::{
    DynModule, FLAG_DEADLY, Module, ModuleCatalog, ModuleContext, ModuleDescriptor,
};

pub struct ShellTool {
    descriptor: ModuleDescriptor,
    script: String,
    /// Incremented when the script prints `ready`
    pub ready: Arc<AtomicUsize>,
}

impl ShellTool {
    pub fn new(name: &str, script: &str, ready: Arc<AtomicUsize>) -> Self {
        Self {
            descriptor: ModuleDescriptor::new(name)
                .watches([EventKind::DnsName])
                .produces([EventKind::Finding]),
            script: script.to_owned(),
            ready,
        }
    }
}

impl Module for ShellTool {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn handle_event(&self, event: Arc<Event>, ctx: ModuleContext) -> Result<(), ModuleError> {
        let mut session = ctx.streamer().start(&["sh", "-c", self.script.as_str()])?;
        while let Some(line) = session.next_line().await {
            if line == "ready" {
                self.ready.fetch_add(1, Ordering::SeqCst);
            } else if let Some(found) = line.strip_prefix("FOUND ") {
                ctx.emit_derived(EventKind::Finding, found, &event)?;
            }
        }
        session.wait().await?;
        Ok(())
    }
}

pub struct Failing {
    descriptor: ModuleDescriptor,
}

impl Failing {
    pub fn new(name: &str, watches: EventKind) -> Self {
        Self {
            descriptor: ModuleDescriptor::new(name).watches([watches]),
        }
    }
}

impl Module for Failing {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn handle_event(&self, _event: Arc<Event>, _ctx: ModuleContext) -> Result<(), ModuleError> {
        Err(ModuleError::Handler("deliberate failure".to_owned()))
    }
}

pub struct Recorder {
    descriptor: ModuleDescriptor,
    pub seen: Arc<Mutex<Vec<Event>>>,
}

impl Recorder {
    pub fn new(descriptor: ModuleDescriptor, seen: Arc<Mutex<Vec<Event>>>) -> Self {
        Self { descriptor, seen }
    }
}

impl Module for Recorder {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn handle_event(&self, event: Arc<Event>, _ctx: ModuleContext) -> Result<(), ModuleError> {
        self.seen.lock().unwrap().push((*event).clone());
        Ok(())
    }
}

pub struct Artifact {
    descriptor: ModuleDescriptor,
}

impl Artifact {
    pub fn new(name: &str) -> Self {
        Self {
            descriptor: ModuleDescriptor::new(name).watches([EventKind::DnsName]),
        }
    }
}

impl Module for Artifact {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn handle_event(&self, event: Arc<Event>, ctx: ModuleContext) -> Result<(), ModuleError> {
        let dir = ctx.module_dir().await?;
        tokio::fs::write(dir.join("output.txt"), format!("{}\n", event.data())).await?;
        Ok(())
    }
}

pub struct Relay {
    descriptor: ModuleDescriptor,
    to: EventKind,
    data: Option<String>,
}

impl Relay {
    pub fn new(name: &str, from: EventKind, to: EventKind) -> Self {
        Self {
            descriptor: ModuleDescriptor::new(name).watches([from]).produces([to]),
            to,
            data: None,
        }
    }

    /// Marks the module deadly.
    pub fn deadly(mut self) -> Self {
        self.descriptor = self.descriptor.flags([FLAG_DEADLY]);
        self
    }

    /// Emits `data` instead of copying the source payload.
    pub fn with_data(mut self, data: &str) -> Self {
        self.data = Some(data.to_owned());
        self
    }
}

impl Module for Relay {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn handle_event(&self, event: Arc<Event>, ctx: ModuleContext) -> Result<(), ModuleError> {
        let data = match &self.data {
            Some(data) => serde_json::Value::from(data.as_str()),
            None => event.data().clone(),
        };
        ctx.emit_derived(self.to, data, &event)
    }
}

/// Registers a factory that builds a fresh module on every call.
pub fn register<M, F>(catalog: &mut ModuleCatalog, name: &str, build: F)
where
    M: Module + 'static,
    F: Fn() -> M + Send + Sync + 'static,
{
    catalog
        .register(name, move |_: &ModuleEntry| Ok(Box::new(build()) as Box<dyn DynModule>))
        .expect("test module names are unique");
}

pub struct Stalled {
    descriptor: ModuleDescriptor,
    pub entered: Arc<AtomicUsize>,
}

impl Stalled {
    pub fn new(name: &str, entered: Arc<AtomicUsize>) -> Self {
        Self {
            descriptor: ModuleDescriptor::new(name).watches([EventKind::DnsName]),
            entered,
        }
    }
}

impl Module for Stalled {
    fn descriptor(&self) -> &ModuleDescriptor {
        &self.descriptor
    }

    async fn handle_event(&self, _event: Arc<Event>, _ctx: ModuleContext) -> Result<(), ModuleError> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        Ok(())
    }
}
