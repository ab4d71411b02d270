pub mod driver;

pub use driver::{
    HopLookup, HopName, HopReport, HopToken, TraceObserver, TraceOutcome, TraceParams, Tracer,
};
