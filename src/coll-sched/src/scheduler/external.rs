use std::ffi::{c_int, c_void};
use std::path::Path;

use libloading::Library;

use crate::algo::AlgoHandle;
use crate::param::SchedulerParam;
use crate::Error;

pub const SCHEDULER_SYMBOL: &[u8] = b"mscclScheduler\0";

/// Parameter block handed to an external scheduler's `select_algo`.
#[repr(C)]
#[derive(Debug)]
pub struct FfiSchedulerParam {
    pub send_buf: *const c_void,
    pub send_counts: *const usize,
    pub send_displs: *const usize,
    pub recv_buf: *mut c_void,
    pub recv_counts: *const usize,
    pub recv_displs: *const usize,
    pub count: usize,
    pub data_type: c_int,
    pub root: c_int,
    pub peer: c_int,
    pub op: c_int,
    pub func: c_int,
    pub rank: c_int,
    pub num_ranks: c_int,
    pub scheduled: bool,
    pub handle: c_int,
}

impl FfiSchedulerParam {
    // the returned block borrows the count arrays of `param`
    fn new(param: &SchedulerParam<'_>) -> Result<Self, Error> {
        let coll = &param.coll;
        let (send_counts, send_displs, recv_counts, recv_displs) = match &coll.var_counts {
            Some(v) => (
                v.send_counts.as_ptr(),
                v.send_displs.as_ptr(),
                v.recv_counts.as_ptr(),
                v.recv_displs.as_ptr(),
            ),
            None => (
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null(),
                std::ptr::null(),
            ),
        };
        Ok(FfiSchedulerParam {
            send_buf: coll.send_buf.0 as *const c_void,
            send_counts,
            send_displs,
            recv_buf: coll.recv_buf.0 as *mut c_void,
            recv_counts,
            recv_displs,
            count: coll.count,
            data_type: coll.data_type as c_int,
            root: to_c_int("root", coll.root)?,
            peer: to_c_int("peer", coll.peer)?,
            op: coll.op as c_int,
            func: coll.func as c_int,
            rank: to_c_int("rank", param.rank)?,
            num_ranks: to_c_int("num_ranks", param.num_ranks)?,
            scheduled: false,
            handle: -1,
        })
    }
}

/// Function table exported by an external scheduler library.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SchedulerInterface {
    pub init: unsafe extern "C" fn() -> c_int,
    pub select_algo: unsafe extern "C" fn(param: *mut FfiSchedulerParam) -> c_int,
    pub teardown: unsafe extern "C" fn() -> c_int,
}

pub struct ExternalScheduler {
    iface: SchedulerInterface,
    // None when the interface lives in this process image
    library: Option<Library>,
}

fn to_c_int(field: &str, value: usize) -> Result<c_int, Error> {
    c_int::try_from(value).map_err(|_| {
        Error::InvalidUsage(format!(
            "{} {} does not fit the scheduler interface",
            field, value
        ))
    })
}

fn check(op: &'static str, code: c_int) -> Result<(), Error> {
    if code == 0 {
        Ok(())
    } else {
        Err(Error::Plugin { op, code })
    }
}

impl ExternalScheduler {
    /// Opens the scheduler library, `None` if it or its symbol is missing.
    pub fn open(path: &Path) -> Option<Self> {
        let library = match unsafe { Library::new(path) } {
            Ok(library) => library,
            Err(e) => {
                log::info!("No external scheduler found ({}), using internal implementation", e);
                return None;
            }
        };
        let iface = unsafe {
            match library.get::<*const SchedulerInterface>(SCHEDULER_SYMBOL) {
                Ok(symbol) => (*symbol).as_ref().copied(),
                Err(e) => {
                    log::debug!("Symbol lookup in {:?} failed: {}", path, e);
                    None
                }
            }
        };
        match iface {
            Some(iface) => {
                log::info!("Using external scheduler from {:?}", path);
                Some(ExternalScheduler {
                    iface,
                    library: Some(library),
                })
            }
            None => {
                log::info!(
                    "Failed to find the scheduler symbol in {:?}, using internal implementation",
                    path
                );
                None
            }
        }
    }

    pub fn from_interface(iface: SchedulerInterface) -> Self {
        ExternalScheduler { iface, library: None }
    }

    pub fn init(&self) -> Result<(), Error> {
        check("init", unsafe { (self.iface.init)() })
    }

    pub fn select(&self, param: &SchedulerParam<'_>) -> Result<Option<AlgoHandle>, Error> {
        let mut ffi_param = FfiSchedulerParam::new(param)?;
        check("select_algo", unsafe { (self.iface.select_algo)(&mut ffi_param) })?;
        if ffi_param.scheduled && ffi_param.handle >= 0 {
            Ok(Some(AlgoHandle(ffi_param.handle as u32)))
        } else {
            Ok(None)
        }
    }

    /// Runs the library's teardown, then unloads it.
    pub fn teardown(self) -> Result<(), Error> {
        let result = check("teardown", unsafe { (self.iface.teardown)() });
        drop(self.library);
        result
    }
}
