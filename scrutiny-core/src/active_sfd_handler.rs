//! Keeps the datastore synchronized with the connected device's firmware
//! identity: loads the matching SFD when a device becomes ready, clears
//! everything when it goes away.

use std::cell::RefCell;
use std::error::Error;
use std::rc::Rc;

use tracing::{debug, error, info, warn};

use crate::datastore::{Datastore, DatastoreEntry, EntryType};
use crate::device_handler::{ConnectionStatus, DeviceHandler};
use crate::error::ScrutinyError;
use crate::sfd::{FirmwareDescription, SfdStorage};

/// The two observations this handler needs from the device side. The device
/// handler implements it; tests substitute a stub.
pub trait DeviceStatusSource {
    fn connection_status(&self) -> ConnectionStatus;
    fn device_id(&self) -> Option<String>;
}

impl DeviceStatusSource for DeviceHandler {
    fn connection_status(&self) -> ConnectionStatus {
        self.get_connection_status()
    }

    fn device_id(&self) -> Option<String> {
        self.get_device_id()
    }
}

pub type SfdLoadedCallback = Box<dyn FnMut(&FirmwareDescription) -> Result<(), Box<dyn Error>>>;
pub type SfdUnloadedCallback = Box<dyn FnMut() -> Result<(), Box<dyn Error>>>;

pub struct ActiveSfdHandler {
    device_handler: Rc<RefCell<dyn DeviceStatusSource>>,
    datastore: Rc<RefCell<Datastore>>,
    storage: Rc<RefCell<SfdStorage>>,
    autoload: bool,
    sfd: Option<FirmwareDescription>,
    previous_device_status: ConnectionStatus,
    requested_firmware_id: Option<String>,
    loaded_callbacks: Vec<SfdLoadedCallback>,
    unloaded_callbacks: Vec<SfdUnloadedCallback>,
}

impl ActiveSfdHandler {
    pub fn new(
        device_handler: Rc<RefCell<dyn DeviceStatusSource>>,
        datastore: Rc<RefCell<Datastore>>,
        storage: Rc<RefCell<SfdStorage>>,
        autoload: bool,
    ) -> Self {
        let mut handler = ActiveSfdHandler {
            device_handler,
            datastore,
            storage,
            autoload,
            sfd: None,
            previous_device_status: ConnectionStatus::Unknown,
            requested_firmware_id: None,
            loaded_callbacks: Vec::new(),
            unloaded_callbacks: Vec::new(),
        };
        handler.reset_active_sfd();
        handler
    }

    /// Callbacks fire synchronously from `process()`. A failing callback is
    /// logged; the remaining ones still run.
    pub fn register_sfd_loaded_callback(&mut self, callback: SfdLoadedCallback) {
        self.loaded_callbacks.push(callback);
    }

    pub fn register_sfd_unloaded_callback(&mut self, callback: SfdUnloadedCallback) {
        self.unloaded_callbacks.push(callback);
    }

    pub fn set_autoload(&mut self, autoload: bool) {
        self.autoload = autoload;
    }

    pub fn get_loaded_sfd(&self) -> Option<&FirmwareDescription> {
        self.sfd.as_ref()
    }

    /// To be called periodically, alongside the device handler's own tick.
    pub fn process(&mut self) {
        let device_status = self.device_handler.borrow().connection_status();

        if self.autoload {
            if device_status != ConnectionStatus::ConnectedReady {
                self.reset_active_sfd();
            } else if self.sfd.is_none() {
                let verbose = self.previous_device_status != device_status;
                let device_id = self.device_handler.borrow().device_id();
                match device_id {
                    Some(device_id) => self.load_sfd(&device_id, verbose),
                    None => error!("No device ID available when connected. This should not happen"),
                }
            }
        }

        if let Some(firmware_id) = self.requested_firmware_id.take() {
            self.load_sfd(&firmware_id, true);
        }

        self.previous_device_status = device_status;
    }

    /// Asks for an explicit SFD load on the next `process()` tick, overriding
    /// the autoload choice. Fails immediately when the firmware is unknown.
    pub fn request_load_sfd(&mut self, firmware_id: &str) -> Result<(), ScrutinyError> {
        if !self.storage.borrow().is_installed(firmware_id) {
            return Err(ScrutinyError::NotInstalled(firmware_id.to_string()));
        }
        self.requested_firmware_id = Some(firmware_id.to_string());
        Ok(())
    }

    fn load_sfd(&mut self, firmware_id: &str, verbose: bool) {
        self.sfd = None;
        self.datastore.borrow_mut().clear();

        let sfd = self.storage.borrow().get(firmware_id).cloned();
        match sfd {
            Some(sfd) => {
                info!("Loading firmware description file (SFD) for firmware ID {firmware_id}");
                {
                    let mut datastore = self.datastore.borrow_mut();
                    for (display_path, variable_def) in sfd.get_vars_for_datastore() {
                        let entry = DatastoreEntry {
                            entry_type: EntryType::Var,
                            display_path: display_path.to_string(),
                            variable_def,
                        };
                        if let Err(e) = datastore.add_entry(entry) {
                            warn!("Cannot add entry \"{display_path}\". {e}");
                        }
                    }
                }
                for callback in &mut self.loaded_callbacks {
                    if let Err(e) = callback(&sfd) {
                        error!("Error in SFD load callback. {e}");
                    }
                }
                self.sfd = Some(sfd);
            }
            None => {
                if verbose {
                    warn!("No SFD file installed for device with firmware ID {firmware_id}");
                }
            }
        }
    }

    fn reset_active_sfd(&mut self) {
        let must_call_callbacks = self.sfd.is_some();

        self.sfd = None;
        self.datastore.borrow_mut().clear();
        if must_call_callbacks {
            debug!("Triggering SFD unload callbacks");
            for callback in &mut self.unloaded_callbacks {
                if let Err(e) = callback() {
                    error!("Error in SFD unload callback. {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datastore::{VariableDef, VariableType};
    use crate::sfd::{SfdMetadata, SfdVariable};

    struct StubStatusSource {
        status: ConnectionStatus,
        device_id: Option<String>,
    }

    impl DeviceStatusSource for StubStatusSource {
        fn connection_status(&self) -> ConnectionStatus {
            self.status
        }

        fn device_id(&self) -> Option<String> {
            self.device_id.clone()
        }
    }

    struct Fixture {
        handler: ActiveSfdHandler,
        datastore: Rc<RefCell<Datastore>>,
        storage: Rc<RefCell<SfdStorage>>,
        status: Rc<RefCell<StubStatusSource>>,
    }

    fn sample_sfd(firmware_id: &str, paths: &[&str]) -> FirmwareDescription {
        FirmwareDescription::new(
            firmware_id.to_string(),
            SfdMetadata::default(),
            paths
                .iter()
                .map(|path| SfdVariable {
                    display_path: path.to_string(),
                    var_type: VariableType::Uint32,
                    address: 0x1000,
                })
                .collect(),
        )
    }

    fn fixture(autoload: bool) -> Fixture {
        let datastore = Rc::new(RefCell::new(Datastore::new()));
        let storage = Rc::new(RefCell::new(SfdStorage::new()));
        let status = Rc::new(RefCell::new(StubStatusSource {
            status: ConnectionStatus::Disconnected,
            device_id: None,
        }));
        let handler = ActiveSfdHandler::new(
            Rc::clone(&status) as Rc<RefCell<dyn DeviceStatusSource>>,
            Rc::clone(&datastore),
            Rc::clone(&storage),
            autoload,
        );
        Fixture {
            handler,
            datastore,
            storage,
            status,
        }
    }

    #[test]
    fn test_autoload_and_unload_round_trip() {
        let mut fixture = fixture(true);
        fixture.storage.borrow_mut().install(sample_sfd("aabb", &["/a", "/b"]));

        let loaded_count = Rc::new(RefCell::new(0));
        let unloaded_count = Rc::new(RefCell::new(0));
        {
            let loaded_count = Rc::clone(&loaded_count);
            fixture.handler.register_sfd_loaded_callback(Box::new(move |sfd| {
                assert_eq!(sfd.firmware_id(), "aabb");
                *loaded_count.borrow_mut() += 1;
                Ok(())
            }));
        }
        {
            let unloaded_count = Rc::clone(&unloaded_count);
            fixture.handler.register_sfd_unloaded_callback(Box::new(move || {
                *unloaded_count.borrow_mut() += 1;
                Ok(())
            }));
        }

        {
            let mut status = fixture.status.borrow_mut();
            status.status = ConnectionStatus::ConnectedReady;
            status.device_id = Some("aabb".to_string());
        }
        fixture.handler.process();
        assert_eq!(fixture.handler.get_loaded_sfd().unwrap().firmware_id(), "aabb");
        assert_eq!(fixture.datastore.borrow().len(), 2);
        assert_eq!(*loaded_count.borrow(), 1);

        // Still loaded while the device stays ready.
        fixture.handler.process();
        assert_eq!(*loaded_count.borrow(), 1);

        fixture.status.borrow_mut().status = ConnectionStatus::Disconnected;
        fixture.handler.process();
        assert!(fixture.handler.get_loaded_sfd().is_none());
        assert!(fixture.datastore.borrow().is_empty());
        assert_eq!(*unloaded_count.borrow(), 1);

        fixture.handler.process();
        assert_eq!(*unloaded_count.borrow(), 1);
    }

    #[test]
    fn test_no_sfd_installed_warns_but_keeps_running() {
        let mut fixture = fixture(true);
        {
            let mut status = fixture.status.borrow_mut();
            status.status = ConnectionStatus::ConnectedReady;
            status.device_id = Some("ffff".to_string());
        }
        fixture.handler.process();
        assert!(fixture.handler.get_loaded_sfd().is_none());
        assert!(fixture.datastore.borrow().is_empty());
    }

    #[test]
    fn test_request_load_sfd_rejects_uninstalled() {
        let mut fixture = fixture(false);
        let result = fixture.handler.request_load_sfd("0123");
        assert!(matches!(result, Err(ScrutinyError::NotInstalled(_))));
        fixture.handler.process();
        assert!(fixture.handler.get_loaded_sfd().is_none());
        assert!(fixture.datastore.borrow().is_empty());
    }

    #[test]
    fn test_explicit_load_works_without_autoload() {
        let mut fixture = fixture(false);
        fixture.storage.borrow_mut().install(sample_sfd("0123", &["/x"]));
        fixture.handler.request_load_sfd("0123").unwrap();
        fixture.handler.process();
        assert_eq!(fixture.handler.get_loaded_sfd().unwrap().firmware_id(), "0123");
        assert_eq!(fixture.datastore.borrow().len(), 1);

        // The request is one-shot.
        fixture.handler.process();
        assert_eq!(fixture.handler.get_loaded_sfd().unwrap().firmware_id(), "0123");
    }

    #[test]
    fn test_duplicate_entries_are_skipped_not_fatal() {
        let mut fixture = fixture(false);
        fixture
            .storage
            .borrow_mut()
            .install(sample_sfd("0123", &["/dup", "/dup", "/unique"]));

        let loaded_count = Rc::new(RefCell::new(0));
        {
            let loaded_count = Rc::clone(&loaded_count);
            fixture.handler.register_sfd_loaded_callback(Box::new(move |_| {
                *loaded_count.borrow_mut() += 1;
                Ok(())
            }));
        }

        fixture.handler.request_load_sfd("0123").unwrap();
        fixture.handler.process();
        assert_eq!(fixture.datastore.borrow().len(), 2);
        assert_eq!(*loaded_count.borrow(), 1);
    }

    #[test]
    fn test_failing_callback_does_not_stop_the_others() {
        let mut fixture = fixture(false);
        fixture.storage.borrow_mut().install(sample_sfd("0123", &["/x"]));

        let second_ran = Rc::new(RefCell::new(false));
        fixture
            .handler
            .register_sfd_loaded_callback(Box::new(|_| Err("callback exploded".into())));
        {
            let second_ran = Rc::clone(&second_ran);
            fixture.handler.register_sfd_loaded_callback(Box::new(move |_| {
                *second_ran.borrow_mut() = true;
                Ok(())
            }));
        }

        fixture.handler.request_load_sfd("0123").unwrap();
        fixture.handler.process();
        assert!(*second_ran.borrow());
        assert!(fixture.handler.get_loaded_sfd().is_some());
    }
}
