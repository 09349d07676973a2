//! A software time tagger implementing the [`NativeLibrary`] seam.
//!
//! Stands in for the vendor SDK so the server runs and the full adapter
//! stack is testable without hardware. Measurement data is synthetic:
//! count rates jitter around a nominal value while the corresponding test
//! signal is enabled, correlations produce a decaying peak around zero
//! delay.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::native::{
    ClassDescriptor, LibraryDescriptor, NativeError, NativeHandle, NativeLibrary, NativeResult,
};
use crate::value::{NdArray, Value};

const NOMINAL_RATE_HZ: f64 = 800_000.0;
const FIRST_VIRTUAL_CHANNEL: i64 = 1000;

/// Simulated native time-tagger library.
pub struct SimLibrary {
    state: Mutex<SimState>,
}

#[derive(Default)]
struct SimState {
    next_handle: u64,
    next_virtual_channel: i64,
    next_serial: u64,
    objects: HashMap<u64, SimObject>,
}

enum SimObject {
    Tagger(TaggerState),
    Measurement(MeasurementState),
    Group(GroupState),
    Snapshot(SnapshotState),
}

struct TaggerState {
    serial: String,
    test_signals: HashMap<i64, bool>,
    trigger_levels: HashMap<i64, f64>,
    /// Derived view handed out by a synchronized group; freeing it does not
    /// tear down the device.
    derived_view: bool,
}

struct MeasurementState {
    kind: MeasKind,
    tagger: u64,
    running: bool,
    run_until: Option<Instant>,
    started: Option<Instant>,
}

enum MeasKind {
    Countrate { channels: Vec<i64> },
    Correlation { binwidth: i64, n_bins: i64 },
    DelayedChannel { channel: i64 },
}

struct GroupState {
    tagger: u64,
    members: Vec<u64>,
}

struct SnapshotState {
    data: NdArray,
    index: Option<NdArray>,
}

impl Default for SimLibrary {
    fn default() -> Self {
        Self::new()
    }
}

impl SimLibrary {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl SimState {
    fn insert(&mut self, object: SimObject) -> NativeHandle {
        self.next_handle += 1;
        let raw = self.next_handle;
        self.objects.insert(raw, object);
        NativeHandle::new(raw)
    }

    fn tagger(&self, raw: u64) -> NativeResult<&TaggerState> {
        match self.objects.get(&raw) {
            Some(SimObject::Tagger(t)) => Ok(t),
            Some(_) => Err(NativeError::InvalidArgument(format!(
                "handle {} is not a time tagger",
                raw
            ))),
            None => Err(NativeError::DanglingHandle(raw)),
        }
    }

    fn tagger_mut(&mut self, raw: u64) -> NativeResult<&mut TaggerState> {
        match self.objects.get_mut(&raw) {
            Some(SimObject::Tagger(t)) => Ok(t),
            Some(_) => Err(NativeError::InvalidArgument(format!(
                "handle {} is not a time tagger",
                raw
            ))),
            None => Err(NativeError::DanglingHandle(raw)),
        }
    }

    /// Channels of a countrate whose test signal is live on its tagger.
    fn countrate_rates(&self, meas: &MeasurementState) -> Vec<f64> {
        let MeasKind::Countrate { channels } = &meas.kind else {
            return Vec::new();
        };
        let signals = match self.objects.get(&meas.tagger) {
            Some(SimObject::Tagger(t)) => Some(&t.test_signals),
            _ => None,
        };
        let mut rng = rand::thread_rng();
        channels
            .iter()
            .map(|ch| {
                let live = signals
                    .and_then(|s| s.get(ch).copied())
                    .unwrap_or(false);
                if live {
                    NOMINAL_RATE_HZ + rng.gen_range(-5_000.0..5_000.0)
                } else {
                    0.0
                }
            })
            .collect()
    }

    fn correlation_histogram(meas: &MeasurementState) -> (NdArray, NdArray) {
        let MeasKind::Correlation { binwidth, n_bins } = meas.kind else {
            return (NdArray::from_i64(&[]), NdArray::from_i64(&[]));
        };
        let mut rng = rand::thread_rng();
        let half = n_bins / 2;
        let width = (n_bins as f64 / 10.0).max(1.0);
        let mut counts = Vec::with_capacity(n_bins as usize);
        let mut index = Vec::with_capacity(n_bins as usize);
        for i in 0..n_bins {
            let x = (i - half) as f64;
            let peak = (1000.0 * (-(x / width).powi(2)).exp()) as i64;
            counts.push(peak + rng.gen_range(0..25));
            index.push((i - half) * binwidth);
        }
        (NdArray::from_i64(&counts), NdArray::from_i64(&index))
    }
}

impl MeasurementState {
    fn is_running(&self) -> bool {
        self.running && self.run_until.map_or(true, |t| Instant::now() < t)
    }

    fn start(&mut self) {
        self.running = true;
        self.run_until = None;
        self.started.get_or_insert_with(Instant::now);
    }

    fn start_for(&mut self, duration_ps: i64, clear: bool) {
        if clear {
            self.started = None;
        }
        self.running = true;
        self.started.get_or_insert_with(Instant::now);
        // Picoseconds of simulated capture map to wall-clock nanoseconds.
        self.run_until = Some(Instant::now() + Duration::from_nanos((duration_ps / 1000) as u64));
    }

    fn stop(&mut self) {
        self.running = false;
        self.run_until = None;
    }

    fn clear(&mut self) {
        self.started = self.running.then(Instant::now);
    }

    fn capture_duration_ps(&self) -> i64 {
        self.started
            .map(|t| (t.elapsed().as_nanos() as i64).saturating_mul(1000))
            .unwrap_or(0)
    }

    /// Lifecycle members shared by every measurement kind.
    fn dispatch_lifecycle(&mut self, method: &str, args: &[Value]) -> Option<NativeResult<Value>> {
        match method {
            "start" => {
                self.start();
                Some(Ok(Value::Null))
            }
            "stop" => {
                self.stop();
                Some(Ok(Value::Null))
            }
            "clear" => {
                self.clear();
                Some(Ok(Value::Null))
            }
            "startFor" => {
                let Some(duration) = args.first().and_then(Value::as_i64).filter(|d| *d > 0)
                else {
                    return Some(Err(NativeError::InvalidArgument(
                        "startFor expects a positive duration in picoseconds".into(),
                    )));
                };
                let clear = args.get(1).and_then(Value::as_bool).unwrap_or(true);
                self.start_for(duration, clear);
                Some(Ok(Value::Null))
            }
            "isRunning" => Some(Ok(Value::Bool(self.is_running()))),
            "getCaptureDuration" => Some(Ok(Value::Int(self.capture_duration_ps()))),
            _ => None,
        }
    }
}

fn int_arg(args: &[Value], idx: usize, name: &str) -> NativeResult<i64> {
    args.get(idx)
        .and_then(Value::as_i64)
        .ok_or_else(|| NativeError::InvalidArgument(format!("'{}' must be an integer", name)))
}

impl NativeLibrary for SimLibrary {
    fn descriptor(&self) -> LibraryDescriptor {
        let lifecycle = [
            "start",
            "stop",
            "clear",
            "startFor",
            "isRunning",
            "getCaptureDuration",
            "waitUntilFinished",
        ];
        let with_lifecycle = |extra: &[&str]| -> Vec<String> {
            lifecycle
                .iter()
                .chain(extra.iter())
                .map(|m| m.to_string())
                .collect()
        };

        let mut countrate = ClassDescriptor::new("Countrate", &["IteratorBase"]);
        countrate.methods = with_lifecycle(&["getData", "getChannels", "getDataObject"]);
        let mut correlation = ClassDescriptor::new("Correlation", &["IteratorBase"]);
        correlation.methods = with_lifecycle(&["getData", "getIndex", "getDataObject"]);
        let mut delayed = ClassDescriptor::new("DelayedChannel", &["IteratorBase"]);
        delayed.methods = with_lifecycle(&["getChannel"]);
        let mut group = ClassDescriptor::new("SynchronizedMeasurements", &[]);
        group.methods = with_lifecycle(&[
            "registerMeasurement",
            "unregisterMeasurement",
            "getTagger",
        ]);

        LibraryDescriptor {
            classes: vec![
                ClassDescriptor::new("TimeTagger", &["TimeTaggerBase"])
                    .with_methods(&[
                        "getSerial",
                        "setTestSignal",
                        "getTestSignal",
                        "setTriggerLevel",
                        "getTriggerLevel",
                        "factoryAccess",
                    ])
                    .with_properties(&["model"]),
                countrate,
                correlation,
                delayed,
                ClassDescriptor::new("CountrateData", &["DataObjectBase"])
                    .with_methods(&["getData", "thisown"]),
                ClassDescriptor::new("CorrelationData", &["DataObjectBase"]).with_methods(&[
                    "getData",
                    "getIndex",
                    "thisown",
                ]),
                group,
                ClassDescriptor::new("ChannelEdge", &["IntEnum"])
                    .with_enum_variants(&[("Rising", 0), ("Falling", 1)]),
                // Legacy attribute-style enums, pre-dating the enum ancestry.
                ClassDescriptor::new("Resolution", &[]).with_enum_variants(&[
                    ("Standard", 0),
                    ("HighResA", 1),
                    ("HighResB", 2),
                    ("HighResC", 3),
                ]),
                ClassDescriptor::new("CoincidenceTimestamp", &[]).with_enum_variants(&[
                    ("Last", 0),
                    ("Average", 1),
                    ("First", 2),
                    ("ListedFirst", 3),
                ]),
                // Denylisted and private members, present so the introspector
                // has something to exclude.
                ClassDescriptor::new("TimeTaggerVirtual", &["TimeTaggerBase"]),
                ClassDescriptor::new("CustomMeasurement", &["IteratorBase"]),
                ClassDescriptor::new("_TaggerInternal", &[]),
            ],
            functions: vec![
                "scanTimeTagger".to_string(),
                "getVersion".to_string(),
                "createTimeTagger".to_string(),
                "freeTimeTagger".to_string(),
                "setLogger".to_string(),
                "_resetBackend".to_string(),
            ],
        }
    }

    fn call_function(&self, name: &str, _args: &[Value]) -> NativeResult<Value> {
        match name {
            "scanTimeTagger" => Ok(Value::List(vec![Value::Str("SIM-000001".into())])),
            "getVersion" => Ok(Value::Str("2.17.4-sim".into())),
            other => Err(NativeError::MissingAttribute(other.to_string())),
        }
    }

    fn create_tagger(&self, class: &str, args: &[Value]) -> NativeResult<NativeHandle> {
        if class != "TimeTagger" {
            return Err(NativeError::UnknownClass(class.to_string()));
        }
        let mut state = self.lock();
        let serial = match args.first() {
            Some(Value::Str(s)) if !s.is_empty() => s.clone(),
            _ => {
                state.next_serial += 1;
                format!("SIM-{:06}", state.next_serial)
            }
        };
        Ok(state.insert(SimObject::Tagger(TaggerState {
            serial,
            test_signals: HashMap::new(),
            trigger_levels: HashMap::new(),
            derived_view: false,
        })))
    }

    fn create_iterator(
        &self,
        class: &str,
        tagger: &NativeHandle,
        args: &[Value],
    ) -> NativeResult<NativeHandle> {
        let mut state = self.lock();
        state.tagger(tagger.raw())?;
        let kind = match class {
            "Countrate" => {
                let channels = args
                    .first()
                    .and_then(Value::as_i64_list)
                    .ok_or_else(|| {
                        NativeError::InvalidArgument("'channels' must be a channel list".into())
                    })?;
                MeasKind::Countrate { channels }
            }
            "Correlation" => {
                int_arg(args, 0, "channel_1")?;
                int_arg(args, 1, "channel_2")?;
                let binwidth = args.get(2).and_then(Value::as_i64).unwrap_or(1000);
                let n_bins = args.get(3).and_then(Value::as_i64).unwrap_or(1000);
                if binwidth <= 0 || n_bins <= 0 {
                    return Err(NativeError::InvalidArgument(
                        "'binwidth' and 'n_bins' must be positive".into(),
                    ));
                }
                MeasKind::Correlation { binwidth, n_bins }
            }
            "DelayedChannel" => {
                int_arg(args, 0, "input_channel")?;
                int_arg(args, 1, "delay")?;
                state.next_virtual_channel += 1;
                MeasKind::DelayedChannel {
                    channel: FIRST_VIRTUAL_CHANNEL + state.next_virtual_channel,
                }
            }
            other => return Err(NativeError::UnknownClass(other.to_string())),
        };
        Ok(state.insert(SimObject::Measurement(MeasurementState {
            kind,
            tagger: tagger.raw(),
            running: true,
            run_until: None,
            started: Some(Instant::now()),
        })))
    }

    fn create_synchronized(&self, tagger: &NativeHandle) -> NativeResult<NativeHandle> {
        let mut state = self.lock();
        state.tagger(tagger.raw())?;
        Ok(state.insert(SimObject::Group(GroupState {
            tagger: tagger.raw(),
            members: Vec::new(),
        })))
    }

    fn call_method(
        &self,
        handle: &NativeHandle,
        method: &str,
        args: &[Value],
    ) -> NativeResult<Value> {
        let mut state = self.lock();
        let raw = handle.raw();
        if !state.objects.contains_key(&raw) {
            return Err(NativeError::DanglingHandle(raw));
        }

        // Countrate data needs the owning tagger's signal states, so compute
        // it before borrowing the measurement mutably.
        if method == "getData" {
            if let Some(SimObject::Measurement(meas)) = state.objects.get(&raw) {
                match meas.kind {
                    MeasKind::Countrate { .. } => {
                        let rates = state.countrate_rates(meas);
                        return Ok(Value::Array(NdArray::from_f64(&rates)));
                    }
                    MeasKind::Correlation { .. } => {
                        let (counts, _) = SimState::correlation_histogram(meas);
                        return Ok(Value::Array(counts));
                    }
                    MeasKind::DelayedChannel { .. } => {}
                }
            }
        }

        match state.objects.get_mut(&raw) {
            Some(SimObject::Tagger(tagger)) => match method {
                "getSerial" => Ok(Value::Str(tagger.serial.clone())),
                "setTestSignal" => {
                    let channels = args.first().and_then(Value::as_i64_list).ok_or_else(|| {
                        NativeError::InvalidArgument("'channel' must be an integer or list".into())
                    })?;
                    let enabled = args.get(1).and_then(Value::as_bool).ok_or_else(|| {
                        NativeError::InvalidArgument("'enabled' must be a boolean".into())
                    })?;
                    for ch in channels {
                        tagger.test_signals.insert(ch, enabled);
                    }
                    Ok(Value::Null)
                }
                "getTestSignal" => {
                    let ch = int_arg(args, 0, "channel")?;
                    Ok(Value::Bool(
                        tagger.test_signals.get(&ch).copied().unwrap_or(false),
                    ))
                }
                "setTriggerLevel" => {
                    let ch = int_arg(args, 0, "channel")?;
                    let level = args.get(1).and_then(Value::as_f64).ok_or_else(|| {
                        NativeError::InvalidArgument("'voltage' must be a number".into())
                    })?;
                    tagger.trigger_levels.insert(ch, level);
                    Ok(Value::Null)
                }
                "getTriggerLevel" => {
                    let ch = int_arg(args, 0, "channel")?;
                    Ok(Value::Float(
                        tagger.trigger_levels.get(&ch).copied().unwrap_or(0.5),
                    ))
                }
                other => Err(NativeError::MissingAttribute(other.to_string())),
            },
            Some(SimObject::Measurement(meas)) => {
                if let Some(result) = meas.dispatch_lifecycle(method, args) {
                    return result;
                }
                match (&meas.kind, method) {
                    (MeasKind::Countrate { channels }, "getChannels") => Ok(Value::List(
                        channels.iter().map(|ch| Value::Int(*ch)).collect(),
                    )),
                    (MeasKind::Correlation { .. }, "getIndex") => {
                        let (_, index) = SimState::correlation_histogram(meas);
                        Ok(Value::Array(index))
                    }
                    (MeasKind::DelayedChannel { channel }, "getChannel") => {
                        Ok(Value::Int(*channel))
                    }
                    (_, other) => Err(NativeError::MissingAttribute(other.to_string())),
                }
            }
            Some(SimObject::Group(_)) => {
                // Group lifecycle fans out to the registered measurements.
                let members = match state.objects.get(&raw) {
                    Some(SimObject::Group(g)) => g.members.clone(),
                    _ => Vec::new(),
                };
                match method {
                    "start" | "stop" | "clear" | "startFor" => {
                        for member in members {
                            if let Some(SimObject::Measurement(meas)) =
                                state.objects.get_mut(&member)
                            {
                                // Result is Null for every lifecycle member.
                                if let Some(Err(e)) = meas.dispatch_lifecycle(method, args) {
                                    return Err(e);
                                }
                            }
                        }
                        Ok(Value::Null)
                    }
                    "isRunning" => {
                        let running = members.iter().any(|member| {
                            matches!(
                                state.objects.get(member),
                                Some(SimObject::Measurement(m)) if m.is_running()
                            )
                        });
                        Ok(Value::Bool(running))
                    }
                    "getCaptureDuration" => {
                        let duration = members
                            .iter()
                            .filter_map(|member| match state.objects.get(member) {
                                Some(SimObject::Measurement(m)) => Some(m.capture_duration_ps()),
                                _ => None,
                            })
                            .max()
                            .unwrap_or(0);
                        Ok(Value::Int(duration))
                    }
                    other => Err(NativeError::MissingAttribute(other.to_string())),
                }
            }
            Some(SimObject::Snapshot(snapshot)) => match method {
                "getData" => Ok(Value::Array(snapshot.data.clone())),
                "getIndex" => snapshot
                    .index
                    .clone()
                    .map(Value::Array)
                    .ok_or_else(|| NativeError::MissingAttribute("getIndex".to_string())),
                other => Err(NativeError::MissingAttribute(other.to_string())),
            },
            None => Err(NativeError::DanglingHandle(raw)),
        }
    }

    fn get_property(&self, handle: &NativeHandle, name: &str) -> NativeResult<Value> {
        let state = self.lock();
        match (state.objects.get(&handle.raw()), name) {
            (Some(SimObject::Tagger(_)), "model") => {
                Ok(Value::Str("Time Tagger Ultra (simulated)".into()))
            }
            (Some(_), other) => Err(NativeError::MissingAttribute(other.to_string())),
            (None, _) => Err(NativeError::DanglingHandle(handle.raw())),
        }
    }

    fn set_property(&self, handle: &NativeHandle, name: &str, _value: Value) -> NativeResult<()> {
        let state = self.lock();
        match (state.objects.get(&handle.raw()), name) {
            (Some(SimObject::Tagger(_)), "model") => Err(NativeError::Call(
                "property 'model' is read-only".to_string(),
            )),
            (Some(_), other) => Err(NativeError::MissingAttribute(other.to_string())),
            (None, _) => Err(NativeError::DanglingHandle(handle.raw())),
        }
    }

    fn delete_property(&self, handle: &NativeHandle, name: &str) -> NativeResult<()> {
        let state = self.lock();
        match state.objects.get(&handle.raw()) {
            Some(_) => Err(NativeError::Call(format!(
                "property '{}' cannot be deleted",
                name
            ))),
            None => Err(NativeError::DanglingHandle(handle.raw())),
        }
    }

    fn data_object(&self, iterator: &NativeHandle) -> NativeResult<(String, NativeHandle)> {
        let mut state = self.lock();
        let snapshot = match state.objects.get(&iterator.raw()) {
            Some(SimObject::Measurement(meas)) => match meas.kind {
                MeasKind::Countrate { .. } => {
                    let rates = state.countrate_rates(meas);
                    ("CountrateData", NdArray::from_f64(&rates), None)
                }
                MeasKind::Correlation { .. } => {
                    let (counts, index) = SimState::correlation_histogram(meas);
                    ("CorrelationData", counts, Some(index))
                }
                MeasKind::DelayedChannel { .. } => {
                    return Err(NativeError::MissingAttribute("getDataObject".into()))
                }
            },
            Some(_) => {
                return Err(NativeError::InvalidArgument(
                    "handle is not a measurement".into(),
                ))
            }
            None => return Err(NativeError::DanglingHandle(iterator.raw())),
        };
        let (class, data, index) = snapshot;
        let handle = state.insert(SimObject::Snapshot(SnapshotState { data, index }));
        Ok((class.to_string(), handle))
    }

    fn register_measurement(
        &self,
        group: &NativeHandle,
        measurement: &NativeHandle,
    ) -> NativeResult<()> {
        let mut state = self.lock();
        if !matches!(
            state.objects.get(&measurement.raw()),
            Some(SimObject::Measurement(_))
        ) {
            return Err(NativeError::InvalidArgument(
                "handle is not a measurement".into(),
            ));
        }
        match state.objects.get_mut(&group.raw()) {
            Some(SimObject::Group(g)) => {
                if !g.members.contains(&measurement.raw()) {
                    g.members.push(measurement.raw());
                }
                Ok(())
            }
            Some(_) => Err(NativeError::InvalidArgument(
                "handle is not a synchronized group".into(),
            )),
            None => Err(NativeError::DanglingHandle(group.raw())),
        }
    }

    fn unregister_measurement(
        &self,
        group: &NativeHandle,
        measurement: &NativeHandle,
    ) -> NativeResult<()> {
        let mut state = self.lock();
        match state.objects.get_mut(&group.raw()) {
            Some(SimObject::Group(g)) => {
                g.members.retain(|m| *m != measurement.raw());
                Ok(())
            }
            Some(_) => Err(NativeError::InvalidArgument(
                "handle is not a synchronized group".into(),
            )),
            None => Err(NativeError::DanglingHandle(group.raw())),
        }
    }

    fn group_tagger(&self, group: &NativeHandle) -> NativeResult<(String, NativeHandle)> {
        let mut state = self.lock();
        let serial = match state.objects.get(&group.raw()) {
            Some(SimObject::Group(g)) => match state.objects.get(&g.tagger) {
                Some(SimObject::Tagger(t)) => t.serial.clone(),
                _ => return Err(NativeError::DanglingHandle(g.tagger)),
            },
            Some(_) => {
                return Err(NativeError::InvalidArgument(
                    "handle is not a synchronized group".into(),
                ))
            }
            None => return Err(NativeError::DanglingHandle(group.raw())),
        };
        let handle = state.insert(SimObject::Tagger(TaggerState {
            serial,
            test_signals: HashMap::new(),
            trigger_levels: HashMap::new(),
            derived_view: true,
        }));
        Ok(("TimeTagger".to_string(), handle))
    }

    fn free_tagger(&self, handle: NativeHandle) -> NativeResult<()> {
        let mut state = self.lock();
        match state.objects.remove(&handle.raw()) {
            Some(SimObject::Tagger(tagger)) => {
                if !tagger.derived_view {
                    tracing::debug!(serial = %tagger.serial, "simulated device teardown");
                }
                Ok(())
            }
            Some(other) => {
                state.objects.insert(handle.raw(), other);
                Err(NativeError::InvalidArgument(
                    "handle is not a time tagger".into(),
                ))
            }
            // Presumed already released.
            None => Err(NativeError::MissingAttribute("freeTimeTagger".into())),
        }
    }

    fn release(&self, handle: NativeHandle) {
        let mut state = self.lock();
        state.objects.remove(&handle.raw());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tagger_round_trip() {
        let lib = SimLibrary::new();
        let tagger = lib.create_tagger("TimeTagger", &[]).unwrap();
        lib.call_method(
            &tagger,
            "setTestSignal",
            &[Value::Int(1), Value::Bool(true)],
        )
        .unwrap();
        let on = lib
            .call_method(&tagger, "getTestSignal", &[Value::Int(1)])
            .unwrap();
        assert_eq!(on, Value::Bool(true));
        let off = lib
            .call_method(&tagger, "getTestSignal", &[Value::Int(2)])
            .unwrap();
        assert_eq!(off, Value::Bool(false));
    }

    #[test]
    fn test_countrate_reflects_test_signal() {
        let lib = SimLibrary::new();
        let tagger = lib.create_tagger("TimeTagger", &[]).unwrap();
        lib.call_method(
            &tagger,
            "setTestSignal",
            &[Value::Int(1), Value::Bool(true)],
        )
        .unwrap();
        let countrate = lib
            .create_iterator(
                "Countrate",
                &tagger,
                &[Value::List(vec![Value::Int(1), Value::Int(2)])],
            )
            .unwrap();
        let data = lib.call_method(&countrate, "getData", &[]).unwrap();
        let rates = data.as_array().and_then(NdArray::to_f64_vec).unwrap();
        assert_eq!(rates.len(), 2);
        assert!(rates[0] > 0.0, "live channel must count");
        assert_eq!(rates[1], 0.0, "silent channel must not count");
    }

    #[test]
    fn test_correlation_histogram_shape() {
        let lib = SimLibrary::new();
        let tagger = lib.create_tagger("TimeTagger", &[]).unwrap();
        let corr = lib
            .create_iterator(
                "Correlation",
                &tagger,
                &[Value::Int(1), Value::Int(2), Value::Int(10), Value::Int(200)],
            )
            .unwrap();
        let counts = lib.call_method(&corr, "getData", &[]).unwrap();
        let index = lib.call_method(&corr, "getIndex", &[]).unwrap();
        assert_eq!(counts.as_array().unwrap().len(), 200);
        let index = index.as_array().and_then(NdArray::to_i64_vec).unwrap();
        assert_eq!(index.len(), 200);
        assert_eq!(index[0], -1000);
    }

    #[test]
    fn test_free_tagger_twice_reports_missing_attribute() {
        let lib = SimLibrary::new();
        let tagger = lib.create_tagger("TimeTagger", &[]).unwrap();
        let raw = tagger.raw();
        lib.free_tagger(tagger).unwrap();
        let err = lib.free_tagger(NativeHandle::new(raw)).unwrap_err();
        assert!(matches!(err, NativeError::MissingAttribute(_)));
    }

    #[test]
    fn test_snapshot_is_frozen() {
        let lib = SimLibrary::new();
        let tagger = lib.create_tagger("TimeTagger", &[]).unwrap();
        lib.call_method(
            &tagger,
            "setTestSignal",
            &[Value::Int(1), Value::Bool(true)],
        )
        .unwrap();
        let countrate = lib
            .create_iterator("Countrate", &tagger, &[Value::Int(1)])
            .unwrap();
        let (class, snapshot) = lib.data_object(&countrate).unwrap();
        assert_eq!(class, "CountrateData");
        let first = lib.call_method(&snapshot, "getData", &[]).unwrap();
        let second = lib.call_method(&snapshot, "getData", &[]).unwrap();
        assert_eq!(first, second, "snapshot data must not change");
    }

    #[test]
    fn test_delayed_channel_shares_measurement_lifecycle() {
        let lib = SimLibrary::new();
        let tagger = lib.create_tagger("TimeTagger", &[]).unwrap();
        let delayed = lib
            .create_iterator("DelayedChannel", &tagger, &[Value::Int(1), Value::Int(500)])
            .unwrap();

        let descriptor = lib.descriptor();
        let class = descriptor
            .classes
            .iter()
            .find(|c| c.name == "DelayedChannel")
            .unwrap();
        for method in ["startFor", "isRunning", "getCaptureDuration"] {
            assert!(class.methods.iter().any(|m| m == method));
        }

        lib.call_method(&delayed, "stop", &[]).unwrap();
        assert_eq!(
            lib.call_method(&delayed, "isRunning", &[]).unwrap(),
            Value::Bool(false)
        );
        let channel = lib.call_method(&delayed, "getChannel", &[]).unwrap();
        assert!(channel.as_i64().unwrap() > 1000);
    }

    #[test]
    fn test_group_lifecycle_fans_out() {
        let lib = SimLibrary::new();
        let tagger = lib.create_tagger("TimeTagger", &[]).unwrap();
        let meas = lib
            .create_iterator("Countrate", &tagger, &[Value::Int(1)])
            .unwrap();
        let group = lib.create_synchronized(&tagger).unwrap();
        lib.register_measurement(&group, &meas).unwrap();

        lib.call_method(&group, "stop", &[]).unwrap();
        assert_eq!(
            lib.call_method(&meas, "isRunning", &[]).unwrap(),
            Value::Bool(false)
        );
        lib.call_method(&group, "start", &[]).unwrap();
        assert_eq!(
            lib.call_method(&group, "isRunning", &[]).unwrap(),
            Value::Bool(true)
        );
    }
}
