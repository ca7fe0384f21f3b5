//! Sample modules
//!
//! Small hand-built modules exercising each transform. The CLI's `demo`
//! command, the integration tests and the benchmarks all start from these.

use crate::ir::{BinaryOp, IrBuilder, IrModule, IrType, MethodFlags, MethodId};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scenario {
    /// Allocate, store two fields, return their sum
    SumOfFields,
    /// Allocation published through a static field and locked
    StaticStore,
    /// Allocation locked around unrelated work
    LocalLock,
    /// Allocation handed to two calls of a non-retaining callee
    PassedTwice,
    /// Synchronized methods locking their receiver
    ThisLock,
    /// Lock held around a virtual call on the locked object
    VirtualLock,
    /// Final field of a loaded object read twice
    FinalReads,
}

impl Scenario {
    pub const ALL: [Scenario; 7] = [
        Scenario::SumOfFields,
        Scenario::StaticStore,
        Scenario::LocalLock,
        Scenario::PassedTwice,
        Scenario::ThisLock,
        Scenario::VirtualLock,
        Scenario::FinalReads,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Scenario::SumOfFields => "sum-of-fields",
            Scenario::StaticStore => "static-store",
            Scenario::LocalLock => "local-lock",
            Scenario::PassedTwice => "passed-twice",
            Scenario::ThisLock => "this-lock",
            Scenario::VirtualLock => "virtual-lock",
            Scenario::FinalReads => "final-reads",
        }
    }

    /// Build the module. `None` only if the builder rejects the sample.
    pub fn build(self) -> Option<Sample> {
        match self {
            Scenario::SumOfFields => sum_of_fields(),
            Scenario::StaticStore => static_store(),
            Scenario::LocalLock => local_lock(),
            Scenario::PassedTwice => passed_twice(),
            Scenario::ThisLock => this_lock(),
            Scenario::VirtualLock => virtual_lock(),
            Scenario::FinalReads => final_reads(),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL
            .into_iter()
            .find(|sc| sc.name() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Scenario::ALL.iter().map(|sc| sc.name()).collect();
                format!("unknown scenario '{}', expected one of: {}", s, known.join(", "))
            })
    }
}

/// A sample module and the method it is about
#[derive(Debug, Clone)]
pub struct Sample {
    pub module: IrModule,
    pub entry: MethodId,
}

fn sum_of_fields() -> Option<Sample> {
    let mut b = IrBuilder::new("sum_of_fields");
    let pair = b.registry_mut().add_class("Pair");
    let x = b.registry_mut().add_field(pair, "x", IrType::I32, false);
    let y = b.registry_mut().add_field(pair, "y", IrType::I32, false);
    let entry = b.registry_mut().add_method(
        pair,
        "sumOfFields",
        vec![],
        IrType::I32,
        MethodFlags::static_method(),
    );

    b.start_function(entry)?;
    let p = b.build_new_obj(pair)?;
    let three = b.build_i32(3)?;
    let four = b.build_i32(4)?;
    b.build_put_field(p, x, three)?;
    b.build_put_field(p, y, four)?;
    let a = b.build_get_field(p, x)?;
    let c = b.build_get_field(p, y)?;
    let sum = b.build_binop(BinaryOp::Add, a, c)?;
    b.build_return(Some(sum))?;
    b.finish_function();

    Some(Sample {
        module: b.finish(),
        entry,
    })
}

fn static_store() -> Option<Sample> {
    let mut b = IrBuilder::new("static_store");
    let pair = b.registry_mut().add_class("Pair");
    let x = b.registry_mut().add_field(pair, "x", IrType::I32, false);
    let holder = b.registry_mut().add_class("Holder");
    let last = b
        .registry_mut()
        .add_static_field(holder, "last", IrType::Object(pair));
    let entry = b.registry_mut().add_method(
        holder,
        "publish",
        vec![],
        IrType::Void,
        MethodFlags::static_method(),
    );

    b.start_function(entry)?;
    let p = b.build_new_obj(pair)?;
    b.build_put_static(last, p)?;
    b.build_monitor_enter(p)?;
    let one = b.build_i32(1)?;
    b.build_put_field(p, x, one)?;
    b.build_monitor_exit(p)?;
    b.build_return(None)?;
    b.finish_function();

    Some(Sample {
        module: b.finish(),
        entry,
    })
}

fn local_lock() -> Option<Sample> {
    let mut b = IrBuilder::new("local_lock");
    let pair = b.registry_mut().add_class("Pair");
    let x = b.registry_mut().add_field(pair, "x", IrType::I32, false);
    let entry = b.registry_mut().add_method(
        pair,
        "lockedScale",
        vec![IrType::I32],
        IrType::I32,
        MethodFlags::static_method(),
    );

    b.start_function(entry)?;
    let n = b.param(0)?;
    let p = b.build_new_obj(pair)?;
    b.build_monitor_enter(p)?;
    let twice = b.build_binop(BinaryOp::Add, n, n)?;
    b.build_put_field(p, x, twice)?;
    let v = b.build_get_field(p, x)?;
    b.build_monitor_exit(p)?;
    b.build_return(Some(v))?;
    b.finish_function();

    Some(Sample {
        module: b.finish(),
        entry,
    })
}

fn passed_twice() -> Option<Sample> {
    let mut b = IrBuilder::new("passed_twice");
    let pair = b.registry_mut().add_class("Pair");
    let x = b.registry_mut().add_field(pair, "x", IrType::I32, false);
    let y = b.registry_mut().add_field(pair, "y", IrType::I32, false);
    let inspect = b.registry_mut().add_method(
        pair,
        "inspect",
        vec![IrType::Object(pair)],
        IrType::I32,
        MethodFlags::static_method(),
    );
    let entry = b.registry_mut().add_method(
        pair,
        "passTwice",
        vec![],
        IrType::I32,
        MethodFlags::static_method(),
    );

    b.start_function(inspect)?;
    let q = b.param(0)?;
    let a = b.build_get_field(q, x)?;
    let c = b.build_get_field(q, y)?;
    let sum = b.build_binop(BinaryOp::Add, a, c)?;
    b.build_return(Some(sum))?;
    b.finish_function();

    b.start_function(entry)?;
    let p = b.build_new_obj(pair)?;
    let one = b.build_i32(1)?;
    let two = b.build_i32(2)?;
    b.build_put_field(p, x, one)?;
    b.build_put_field(p, y, two)?;
    let first = b.build_call(inspect, vec![p])??;
    let second = b.build_call(inspect, vec![p])??;
    let total = b.build_binop(BinaryOp::Add, first, second)?;
    b.build_return(Some(total))?;
    b.finish_function();

    Some(Sample {
        module: b.finish(),
        entry,
    })
}

fn this_lock() -> Option<Sample> {
    let mut b = IrBuilder::new("this_lock");
    let counter = b.registry_mut().add_class("Counter");
    let count = b
        .registry_mut()
        .add_field(counter, "count", IrType::I32, false);
    let receiver = vec![IrType::Object(counter)];
    let inc = b.registry_mut().add_method(
        counter,
        "inc",
        receiver.clone(),
        IrType::Void,
        MethodFlags::instance().synchronized(),
    );
    let entry = b.registry_mut().add_method(
        counter,
        "incTwice",
        receiver,
        IrType::Void,
        MethodFlags::instance().synchronized(),
    );
    let fresh = b.registry_mut().add_method(
        counter,
        "fresh",
        vec![],
        IrType::I32,
        MethodFlags::static_method(),
    );

    b.start_function(inc)?;
    let this = b.param(0)?;
    b.build_monitor_enter(this)?;
    let c = b.build_get_field(this, count)?;
    let one = b.build_i32(1)?;
    let next = b.build_binop(BinaryOp::Add, c, one)?;
    b.build_put_field(this, count, next)?;
    b.build_monitor_exit(this)?;
    b.build_return(None)?;
    b.finish_function();

    b.start_function(entry)?;
    let this = b.param(0)?;
    b.build_monitor_enter(this)?;
    b.build_call(inc, vec![this])?;
    b.build_call(inc, vec![this])?;
    b.build_monitor_exit(this)?;
    b.build_return(None)?;
    b.finish_function();

    b.start_function(fresh)?;
    let c = b.build_new_obj(counter)?;
    b.build_call(inc, vec![c])?;
    let v = b.build_get_field(c, count)?;
    b.build_return(Some(v))?;
    b.finish_function();

    Some(Sample {
        module: b.finish(),
        entry,
    })
}

fn virtual_lock() -> Option<Sample> {
    let mut b = IrBuilder::new("virtual_lock");
    let widget = b.registry_mut().add_class("Widget");
    let poke = b.registry_mut().add_method(
        widget,
        "poke",
        vec![IrType::Object(widget)],
        IrType::Void,
        MethodFlags::instance(),
    );
    let entry = b.registry_mut().add_method(
        widget,
        "lockAndPoke",
        vec![IrType::Bool],
        IrType::Void,
        MethodFlags::static_method(),
    );

    b.start_function(poke)?;
    b.build_return(None)?;
    b.finish_function();

    // if (flag) poke(w) happens under the lock, otherwise only the lock
    b.start_function(entry)?;
    let flag = b.param(0)?;
    let w = b.build_new_obj(widget)?;
    b.build_monitor_enter(w)?;
    let call = b.create_block()?;
    let done = b.create_block()?;
    b.build_cond_branch(flag, call, done)?;
    b.switch_to_block(call);
    b.build_virtual_call(poke, vec![w])?;
    b.build_branch(done)?;
    b.switch_to_block(done);
    b.build_monitor_exit(w)?;
    b.build_return(None)?;
    b.finish_function();

    Some(Sample {
        module: b.finish(),
        entry,
    })
}

fn final_reads() -> Option<Sample> {
    let mut b = IrBuilder::new("final_reads");
    let config = b.registry_mut().add_class("Config");
    let limit = b
        .registry_mut()
        .add_field(config, "limit", IrType::I32, true);
    let current = b
        .registry_mut()
        .add_static_field(config, "current", IrType::Object(config));
    let entry = b.registry_mut().add_method(
        config,
        "twiceLimit",
        vec![],
        IrType::I32,
        MethodFlags::static_method(),
    );

    b.start_function(entry)?;
    let c = b.build_get_static(current)?;
    let a = b.build_get_field(c, limit)?;
    let d = b.build_get_field(c, limit)?;
    let sum = b.build_binop(BinaryOp::Add, a, d)?;
    b.build_return(Some(sum))?;
    b.finish_function();

    Some(Sample {
        module: b.finish(),
        entry,
    })
}
