//! # Address-Space Views
//!
//! The broker reads a target's loader list and writes its being-debugged flag
//! through an [`AddressSpaceView`]. The view holds the process's rundown
//! protection and the address-space lock for as long as it lives, and gives
//! both back on drop.

use parking_lot::MutexGuard;

use super::image::MappedImage;
use super::process::Process;

/// The user-visible part of a process address space the broker touches.
#[derive(Debug, Clone, Default)]
pub struct AddressSpace
{
    pub(crate) being_debugged: bool,
    /// Loader list in load order; the main image comes first.
    pub(crate) modules: Vec<MappedImage>,
}

impl AddressSpace
{
    pub(crate) fn new(modules: Vec<MappedImage>) -> Self
    {
        Self {
            being_debugged: false,
            modules,
        }
    }
}

/// Scoped access to another process's address space.
///
/// ## Example
///
/// ```rust
/// use debugport_core::platform::{AddressSpaceView, ProcessSpec, ProcessTable};
///
/// let table = ProcessTable::new();
/// let process = table.create(ProcessSpec::new("target"));
/// if let Some(mut view) = AddressSpaceView::adopt(&process) {
///     view.set_being_debugged(true);
/// };
/// ```
pub struct AddressSpaceView<'a>
{
    process: &'a Process,
    space: MutexGuard<'a, Option<AddressSpace>>,
}

impl<'a> AddressSpaceView<'a>
{
    /// Adopt `process`'s address space.
    ///
    /// Returns `None` if the process is exiting or has no user address space.
    pub fn adopt(process: &'a Process) -> Option<Self>
    {
        if !process.rundown().try_acquire() {
            return None;
        }
        let space = process.address_space.lock();
        if space.is_none() {
            drop(space);
            process.rundown().release();
            return None;
        }
        Some(Self { process, space })
    }

    /// Loader list, main image first.
    pub fn loaded_modules(&self) -> &[MappedImage]
    {
        match self.space.as_ref() {
            Some(space) => &space.modules,
            None => &[],
        }
    }

    pub fn being_debugged(&self) -> bool
    {
        self.space.as_ref().is_some_and(|space| space.being_debugged)
    }

    pub fn set_being_debugged(&mut self, value: bool)
    {
        if let Some(space) = self.space.as_mut() {
            space.being_debugged = value;
        }
    }
}

impl Drop for AddressSpaceView<'_>
{
    fn drop(&mut self)
    {
        self.process.rundown().release();
    }
}

#[cfg(test)]
mod tests
{
    use super::*;
    use crate::platform::{ProcessSpec, ProcessTable};
    use crate::types::{Address, NtStatus};

    #[test]
    fn test_view_lists_main_image_first()
    {
        let table = ProcessTable::new();
        let main = MappedImage::new(Address::new(0x40_0000), 0x1000);
        let process = table.create(ProcessSpec::new("target").with_image(main.clone()));
        process.map_image(MappedImage::new(Address::new(0x7ff0_0000), 0x2000));

        let view = AddressSpaceView::adopt(&process).unwrap();
        assert_eq!(view.loaded_modules().len(), 2);
        assert_eq!(view.loaded_modules()[0], main);
    }

    #[test]
    fn test_view_refused_for_exiting_or_spaceless_process()
    {
        let table = ProcessTable::new();
        let spaceless = table.create(ProcessSpec::new("kernel-ish").without_address_space());
        assert!(AddressSpaceView::adopt(&spaceless).is_none());
        assert_eq!(spaceless.rundown().holders(), 0);

        let exiting = table.create(ProcessSpec::new("exiting"));
        exiting.terminate(NtStatus::SUCCESS);
        assert!(AddressSpaceView::adopt(&exiting).is_none());
    }

    #[test]
    fn test_flag_write_is_visible_to_next_view()
    {
        let table = ProcessTable::new();
        let process = table.create(ProcessSpec::new("target"));
        AddressSpaceView::adopt(&process).unwrap().set_being_debugged(true);
        assert!(AddressSpaceView::adopt(&process).unwrap().being_debugged());
        assert_eq!(process.rundown().holders(), 0);
    }
}
