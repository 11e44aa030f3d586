//! RPC request model.
//!
//! An [`RpcRequest`] describes one remote procedure call: the target
//! procedure, option flags, the ordered parameter slots with their per-slot
//! option byte, and the bookkeeping filled in while the call's results are
//! read back (rows affected, error and warning ranges).
//!
//! Requests are scratch objects. They are taken from an
//! [`RpcRequestPool`](crate::pool::RpcRequestPool), filled by one of the
//! `build_*` methods, sent, read back and returned. [`RpcRequest::reset`]
//! restores the freshly-allocated state.
//!
//! ## Call shapes
//!
//! ```text
//! sp_executesql   [stmt, decl?]            + user params
//! sp_prepexec     [@handle OUT, decl, stmt] + user params
//! sp_execute      [handle]                 + user params
//! sp_unprepare    [handle]
//! named procedure                          user params (incl. return value)
//! ```

use std::ops::Range;

use bitflags::bitflags;

use crate::error::RpcError;
use crate::param::{ParamValue, Parameter, ParameterDirection};
use crate::param_list::{build_param_list, should_send};
use crate::types::{SqlDbType, TYPE_SIZE_LIMIT};

/// Well-known system procedure ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ProcId {
    /// sp_executesql (0x000A)
    ExecuteSql = 0x000A,
    /// sp_prepare (0x000B)
    Prepare = 0x000B,
    /// sp_execute (0x000C)
    Execute = 0x000C,
    /// sp_prepexec (0x000D)
    PrepExec = 0x000D,
    /// sp_unprepare (0x000F)
    Unprepare = 0x000F,
}

impl ProcId {
    /// Procedure name, for logging.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::ExecuteSql => "sp_executesql",
            Self::Prepare => "sp_prepare",
            Self::Execute => "sp_execute",
            Self::PrepExec => "sp_prepexec",
            Self::Unprepare => "sp_unprepare",
        }
    }
}

bitflags! {
    /// RPC option flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RpcOptionFlags: u16 {
        /// Recompile the procedure.
        const WITH_RECOMPILE = 0x0001;
        /// Suppress column metadata in the response.
        const NO_METADATA = 0x0002;
        /// Reuse metadata from the previous call.
        const REUSE_METADATA = 0x0004;
    }
}

bitflags! {
    /// Per-parameter status byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ParamFlags: u8 {
        /// Passed by reference (output parameter).
        const BY_REF = 0x01;
        /// Use the server-side default value.
        const DEFAULT = 0x02;
        /// Value is encrypted.
        const ENCRYPTED = 0x08;
    }
}

impl ParamFlags {
    /// Flags a user parameter is sent with.
    ///
    /// The default bit is only set for non-output parameters without a value;
    /// the encrypted bit is set iff cipher metadata is attached.
    #[must_use]
    pub fn for_parameter(param: &Parameter) -> Self {
        let mut flags = Self::empty();
        if param.direction.is_by_ref() {
            flags |= Self::BY_REF;
        }
        if param.direction != ParameterDirection::Output && param.value.is_none() {
            flags |= Self::DEFAULT;
        }
        if param.cipher.is_some() {
            flags |= Self::ENCRYPTED;
        }
        flags
    }
}

/// What the request calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcTarget {
    /// A well-known system procedure.
    Id(ProcId),
    /// A procedure by name.
    Name(String),
}

/// Where a slot's parameter came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamSource {
    /// Synthesized by the driver (statement text, declarations, handle).
    System,
    /// The user parameter at this index of the command's collection.
    User(usize),
}

/// One filled parameter slot.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcParam {
    /// The parameter as sent.
    pub param: Parameter,
    /// Where it came from.
    pub source: ParamSource,
}

/// One remote procedure call.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    target: Option<RpcTarget>,
    options: RpcOptionFlags,
    slots: Vec<Option<RpcParam>>,
    flags: Vec<ParamFlags>,
    param_count: usize,
    system_param_count: usize,
    /// Rows affected by this call, when the server reported a count.
    pub records_affected: Option<i64>,
    /// Running total across a batch, `-1` until set.
    pub cumulative_records_affected: i64,
    /// Range of this call's errors in the shared error list.
    pub errors: Range<usize>,
    /// Range of this call's warnings in the shared warning list.
    pub warnings: Range<usize>,
    /// The call has parameters whose encryption metadata must be fetched.
    pub needs_fetch_param_encryption_metadata: bool,
}

impl RpcRequest {
    /// Create an empty request with room for `capacity` parameters.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            target: None,
            options: RpcOptionFlags::empty(),
            slots: vec![None; capacity],
            flags: vec![ParamFlags::empty(); capacity],
            param_count: 0,
            system_param_count: 0,
            records_affected: None,
            cumulative_records_affected: -1,
            errors: 0..0,
            warnings: 0..0,
            needs_fetch_param_encryption_metadata: false,
        }
    }

    /// Restore the freshly-allocated state, keeping the slot capacity.
    pub fn reset(&mut self) {
        self.target = None;
        self.options = RpcOptionFlags::empty();
        for slot in &mut self.slots {
            *slot = None;
        }
        for flag in &mut self.flags {
            *flag = ParamFlags::empty();
        }
        self.param_count = 0;
        self.system_param_count = 0;
        self.records_affected = None;
        self.cumulative_records_affected = -1;
        self.errors = 0..0;
        self.warnings = 0..0;
        self.needs_fetch_param_encryption_metadata = false;
    }

    /// Whether the request is in its freshly-allocated state.
    #[must_use]
    pub fn is_reset(&self) -> bool {
        self.target.is_none()
            && self.options.is_empty()
            && self.slots.iter().all(Option::is_none)
            && self.flags.iter().all(|f| f.is_empty())
            && self.param_count == 0
            && self.system_param_count == 0
            && self.records_affected.is_none()
            && self.cumulative_records_affected == -1
            && self.errors.is_empty()
            && self.warnings.is_empty()
            && !self.needs_fetch_param_encryption_metadata
    }

    /// Number of parameter slots allocated.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of filled parameter slots.
    #[must_use]
    pub fn param_count(&self) -> usize {
        self.param_count
    }

    /// Number of leading driver-synthesized slots.
    #[must_use]
    pub fn system_param_count(&self) -> usize {
        self.system_param_count
    }

    /// Call target.
    #[must_use]
    pub fn target(&self) -> Option<&RpcTarget> {
        self.target.as_ref()
    }

    /// Option flags.
    #[must_use]
    pub fn options(&self) -> RpcOptionFlags {
        self.options
    }

    /// Set option flags.
    pub fn set_options(&mut self, options: RpcOptionFlags) {
        self.options = options;
    }

    /// The parameter in a slot.
    #[must_use]
    pub fn param(&self, index: usize) -> Option<&RpcParam> {
        self.slots.get(index).and_then(Option::as_ref)
    }

    /// The parameter in a slot, mutably.
    pub fn param_mut(&mut self, index: usize) -> Option<&mut RpcParam> {
        self.slots.get_mut(index).and_then(Option::as_mut)
    }

    /// The option byte of a slot.
    #[must_use]
    pub fn param_flags(&self, index: usize) -> ParamFlags {
        self.flags.get(index).copied().unwrap_or_default()
    }

    /// Iterate over filled slots with their option bytes.
    pub fn params(&self) -> impl Iterator<Item = (&RpcParam, ParamFlags)> + '_ {
        self.slots[..self.param_count]
            .iter()
            .zip(self.flags.iter().copied())
            .filter_map(|(slot, flags)| slot.as_ref().map(|p| (p, flags)))
    }

    /// Iterate over the user parameter slots.
    pub fn user_params(&self) -> impl Iterator<Item = (usize, &RpcParam)> + '_ {
        self.params().filter_map(|(p, _)| match p.source {
            ParamSource::User(i) => Some((i, p)),
            ParamSource::System => None,
        })
    }

    /// Place a parameter into a slot.
    pub fn set_param(
        &mut self,
        index: usize,
        param: RpcParam,
        flags: ParamFlags,
    ) -> Result<(), RpcError> {
        let count = self.slots.len();
        let (Some(slot), Some(flag)) = (self.slots.get_mut(index), self.flags.get_mut(index)) else {
            return Err(RpcError::SlotOutOfRange { index, count });
        };
        *slot = Some(param);
        *flag = flags;
        if index >= self.param_count {
            self.param_count = index + 1;
        }
        Ok(())
    }

    fn begin(&mut self, target: RpcTarget, required: usize) {
        self.reset();
        if self.slots.len() < required {
            self.slots.resize(required, None);
            self.flags.resize(required, ParamFlags::empty());
        }
        self.target = Some(target);
    }

    fn push_system(&mut self, param: Parameter, flags: ParamFlags) -> Result<(), RpcError> {
        let index = self.param_count;
        self.set_param(
            index,
            RpcParam {
                param,
                source: ParamSource::System,
            },
            flags,
        )?;
        self.system_param_count += 1;
        Ok(())
    }

    fn push_user_params(
        &mut self,
        params: &[Parameter],
        include_return_value: bool,
    ) -> Result<(), RpcError> {
        for (i, p) in params.iter().enumerate() {
            if !should_send(p, include_return_value) {
                continue;
            }
            let index = self.param_count;
            self.set_param(
                index,
                RpcParam {
                    param: p.clone(),
                    source: ParamSource::User(i),
                },
                ParamFlags::for_parameter(p),
            )?;
        }
        Ok(())
    }

    /// Fill as an `sp_executesql` call.
    ///
    /// The declaration slot is only present when at least one parameter is
    /// sent.
    pub fn build_execute_sql(&mut self, text: &str, params: &[Parameter]) -> Result<(), RpcError> {
        let decl = build_param_list(params, false)?;
        let sent = params.iter().filter(|p| should_send(p, false)).count();
        self.begin(RpcTarget::Id(ProcId::ExecuteSql), 2 + sent);
        self.push_system(text_param(text), ParamFlags::empty())?;
        if sent > 0 {
            self.push_system(text_param(&decl), ParamFlags::empty())?;
        }
        self.push_user_params(params, false)
    }

    /// Fill as an `sp_prepexec` call.
    ///
    /// The first slot is the in/out handle, seeded with the previous handle
    /// when one exists.
    pub fn build_prep_exec(
        &mut self,
        previous_handle: Option<i32>,
        text: &str,
        params: &[Parameter],
    ) -> Result<(), RpcError> {
        let decl = build_param_list(params, false)?;
        let sent = params.iter().filter(|p| should_send(p, false)).count();
        self.begin(RpcTarget::Id(ProcId::PrepExec), 3 + sent);
        let handle = Parameter::new("", SqlDbType::Int)
            .with_direction(ParameterDirection::InputOutput)
            .with_value(previous_handle.map_or(ParamValue::Null, ParamValue::from));
        self.push_system(handle, ParamFlags::BY_REF)?;
        self.push_system(text_param(&decl), ParamFlags::empty())?;
        self.push_system(text_param(text), ParamFlags::empty())?;
        self.push_user_params(params, false)
    }

    /// Fill as an `sp_execute` call against a prepared handle.
    pub fn build_execute(&mut self, handle: i32, params: &[Parameter]) -> Result<(), RpcError> {
        let sent = params.iter().filter(|p| should_send(p, false)).count();
        self.begin(RpcTarget::Id(ProcId::Execute), 1 + sent);
        self.push_system(handle_param(handle), ParamFlags::empty())?;
        self.push_user_params(params, false)
    }

    /// Fill as an `sp_unprepare` call.
    pub fn build_unprepare(&mut self, handle: i32) -> Result<(), RpcError> {
        self.begin(RpcTarget::Id(ProcId::Unprepare), 1);
        self.push_system(handle_param(handle), ParamFlags::empty())
    }

    /// Fill as a call to a named procedure. The return value is sent.
    pub fn build_named(&mut self, procedure: &str, params: &[Parameter]) -> Result<(), RpcError> {
        for (i, p) in params.iter().enumerate() {
            p.validate(i, true)?;
        }
        self.begin(RpcTarget::Name(procedure.to_string()), params.len());
        self.push_user_params(params, true)
    }

    /// Procedure name for logging.
    #[must_use]
    pub fn display_name(&self) -> &str {
        match &self.target {
            Some(RpcTarget::Id(id)) => id.name(),
            Some(RpcTarget::Name(name)) => name,
            None => "",
        }
    }
}

/// Slots needed to build a call of the given shape.
#[must_use]
pub fn required_slots(target: &RpcTarget, params: &[Parameter]) -> usize {
    match target {
        RpcTarget::Id(ProcId::ExecuteSql) => 2 + params.iter().filter(|p| should_send(p, false)).count(),
        RpcTarget::Id(ProcId::PrepExec) => 3 + params.iter().filter(|p| should_send(p, false)).count(),
        RpcTarget::Id(ProcId::Execute | ProcId::Prepare) => {
            1 + params.iter().filter(|p| should_send(p, false)).count()
        }
        RpcTarget::Id(ProcId::Unprepare) => 1,
        RpcTarget::Name(_) => params.len(),
    }
}

/// Statement or declaration text as an `nvarchar`, or `ntext` once it no
/// longer fits.
fn text_param(text: &str) -> Parameter {
    let chars = text.encode_utf16().count();
    let fits = chars.saturating_mul(2) <= usize::try_from(TYPE_SIZE_LIMIT).unwrap_or(usize::MAX);
    let db_type = if fits {
        SqlDbType::NVarChar
    } else {
        SqlDbType::NText
    };
    Parameter::input("", db_type, text).with_size(i32::try_from(chars).unwrap_or(i32::MAX))
}

fn handle_param(handle: i32) -> Parameter {
    Parameter::input("", SqlDbType::Int, handle)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn user_params() -> Vec<Parameter> {
        vec![
            Parameter::return_value("@ret"),
            Parameter::input("@id", SqlDbType::Int, 7),
            Parameter::new("@total", SqlDbType::Int).with_direction(ParameterDirection::Output),
        ]
    }

    #[test]
    fn test_param_flags() {
        let input = Parameter::input("@a", SqlDbType::Int, 1);
        assert_eq!(ParamFlags::for_parameter(&input), ParamFlags::empty());

        let absent = Parameter::new("@a", SqlDbType::Int);
        assert_eq!(ParamFlags::for_parameter(&absent), ParamFlags::DEFAULT);

        let out = Parameter::new("@a", SqlDbType::Int).with_direction(ParameterDirection::Output);
        assert_eq!(ParamFlags::for_parameter(&out), ParamFlags::BY_REF);

        let inout = Parameter::new("@a", SqlDbType::Int)
            .with_direction(ParameterDirection::InputOutput);
        assert_eq!(
            ParamFlags::for_parameter(&inout),
            ParamFlags::BY_REF | ParamFlags::DEFAULT
        );
    }

    #[test]
    fn test_execute_sql_shape() {
        let mut rpc = RpcRequest::with_capacity(0);
        rpc.build_execute_sql("SELECT @id", &user_params()).unwrap();

        assert_eq!(rpc.target(), Some(&RpcTarget::Id(ProcId::ExecuteSql)));
        assert_eq!(rpc.system_param_count(), 2);
        assert_eq!(rpc.param_count(), 4);
        assert_eq!(
            rpc.param(0).unwrap().param.value,
            Some(ParamValue::Text("SELECT @id".into()))
        );
        assert_eq!(
            rpc.param(1).unwrap().param.value,
            Some(ParamValue::Text("@id int,@total int output".into()))
        );
        assert_eq!(rpc.param(2).unwrap().source, ParamSource::User(1));
        assert_eq!(rpc.param_flags(3), ParamFlags::BY_REF);
    }

    #[test]
    fn test_execute_sql_without_params_has_no_declaration() {
        let mut rpc = RpcRequest::with_capacity(2);
        rpc.build_execute_sql("SELECT 1", &[]).unwrap();
        assert_eq!(rpc.param_count(), 1);
        assert!(rpc.param(1).is_none());
    }

    #[test]
    fn test_prep_exec_shape() {
        let mut rpc = RpcRequest::with_capacity(0);
        rpc.build_prep_exec(None, "SELECT @id", &user_params()).unwrap();
        assert_eq!(rpc.system_param_count(), 3);
        assert_eq!(rpc.param_flags(0), ParamFlags::BY_REF);
        assert_eq!(rpc.param(0).unwrap().param.value, Some(ParamValue::Null));
        assert_eq!(
            rpc.param(2).unwrap().param.value,
            Some(ParamValue::Text("SELECT @id".into()))
        );

        rpc.build_prep_exec(Some(12), "SELECT @id", &user_params()).unwrap();
        assert_eq!(rpc.param(0).unwrap().param.value, Some(ParamValue::Int(12)));
    }

    #[test]
    fn test_execute_and_unprepare_shapes() {
        let mut rpc = RpcRequest::with_capacity(0);
        rpc.build_execute(5, &user_params()).unwrap();
        assert_eq!(rpc.param_count(), 3);
        assert_eq!(rpc.param(0).unwrap().param.value, Some(ParamValue::Int(5)));

        rpc.build_unprepare(5).unwrap();
        assert_eq!(rpc.target(), Some(&RpcTarget::Id(ProcId::Unprepare)));
        assert_eq!(rpc.param_count(), 1);
        assert!(rpc.param(1).is_none());
    }

    #[test]
    fn test_named_includes_return_value() {
        let mut rpc = RpcRequest::with_capacity(0);
        rpc.build_named("GetOrder", &user_params()).unwrap();
        assert_eq!(rpc.display_name(), "GetOrder");
        assert_eq!(rpc.param_count(), 3);
        assert_eq!(rpc.system_param_count(), 0);
        assert_eq!(rpc.user_params().count(), 3);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut rpc = RpcRequest::with_capacity(4);
        rpc.build_prep_exec(Some(3), "SELECT @id", &user_params()).unwrap();
        rpc.set_options(RpcOptionFlags::NO_METADATA);
        rpc.records_affected = Some(4);
        rpc.cumulative_records_affected = 10;
        rpc.errors = 1..3;
        rpc.warnings = 2..2;
        rpc.needs_fetch_param_encryption_metadata = true;
        assert!(!rpc.is_reset());

        let capacity = rpc.capacity();
        rpc.reset();
        assert!(rpc.is_reset());
        assert_eq!(rpc.capacity(), capacity);
        assert!((0..capacity).all(|i| rpc.param(i).is_none()));
    }

    #[test]
    fn test_set_param_out_of_range() {
        let mut rpc = RpcRequest::with_capacity(1);
        let p = RpcParam {
            param: Parameter::input("@a", SqlDbType::Int, 1),
            source: ParamSource::User(0),
        };
        assert!(matches!(
            rpc.set_param(1, p, ParamFlags::empty()),
            Err(RpcError::SlotOutOfRange { index: 1, count: 1 })
        ));
    }

    #[test]
    fn test_required_slots() {
        let params = user_params();
        assert_eq!(required_slots(&RpcTarget::Id(ProcId::ExecuteSql), &params), 4);
        assert_eq!(required_slots(&RpcTarget::Id(ProcId::PrepExec), &params), 5);
        assert_eq!(required_slots(&RpcTarget::Id(ProcId::Execute), &params), 3);
        assert_eq!(required_slots(&RpcTarget::Id(ProcId::Unprepare), &params), 1);
        assert_eq!(required_slots(&RpcTarget::Name("p".into()), &params), 3);
    }
}
