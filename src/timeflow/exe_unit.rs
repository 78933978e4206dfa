use crate::base::port::{InputPort, OutputPort, Port};
use crate::timeflow::config::CoreConfig;
use crate::timeflow::isa::{AluOp, ExeType, Instr};
use crate::timeflow::trace::{TraceArena, TraceId};
use crate::timeq::{Cycle, ServerConfig, ServiceRequest, TimedServer};

/// Capability set shared by every execution unit. A unit owns one input and one output port per
/// issue lane. In each tick it either consumes a lane's input (and later emits it) or leaves it
/// in the port, which the issue stage sees as a full port.
pub trait ExeUnit {
    fn exe_type(&self) -> ExeType;

    fn tick(&mut self, now: Cycle, traces: &mut TraceArena);

    fn reset(&mut self);

    fn inputs_mut(&mut self) -> &mut [Port<InputPort, TraceId>];

    fn outputs_mut(&mut self) -> &mut [Port<OutputPort, TraceId>];

    /// Nothing accepted and not yet emitted.
    fn is_idle(&self) -> bool;
}

/// Lanes of fixed-latency pipelines. Each lane has one pipeline per latency class; the class of
/// an instruction is picked by `classify`.
#[derive(Debug)]
struct Pipelines {
    inputs: Vec<Port<InputPort, TraceId>>,
    outputs: Vec<Port<OutputPort, TraceId>>,
    lanes: Vec<Vec<TimedServer<TraceId>>>,
}

impl Pipelines {
    fn new(num_lanes: usize, latencies: &[Cycle], depth: usize) -> Self {
        Self {
            inputs: (0..num_lanes).map(|_| Port::new()).collect(),
            outputs: (0..num_lanes).map(|_| Port::new()).collect(),
            lanes: (0..num_lanes)
                .map(|_| {
                    latencies
                        .iter()
                        .map(|&lat| TimedServer::new(ServerConfig::pipelined(lat, depth)))
                        .collect()
                })
                .collect(),
        }
    }

    fn tick(&mut self, now: Cycle, traces: &TraceArena, classify: impl Fn(&Instr) -> usize) {
        for (lane, pipes) in self.lanes.iter_mut().enumerate() {
            let output = &mut self.outputs[lane];
            for pipe in pipes.iter_mut() {
                while pipe.peek_ready(now).is_some() && !output.full() {
                    if let Some(done) = pipe.pop_ready(now) {
                        output
                            .try_push(now, done.payload)
                            .expect("output port checked for room");
                    }
                }
            }

            let input = &mut self.inputs[lane];
            let Some(id) = input.peek(now) else {
                continue;
            };
            if output.full() {
                continue;
            }
            let class = classify(traces[id].instr());
            if pipes[class]
                .try_enqueue(now, ServiceRequest::new(id, 0))
                .is_ok()
            {
                input.pop(now);
            }
        }
    }

    fn reset(&mut self) {
        self.lanes.iter_mut().flatten().for_each(TimedServer::clear);
        self.inputs.iter_mut().for_each(Port::clear);
    }

    fn is_idle(&self) -> bool {
        self.lanes.iter().flatten().all(TimedServer::is_empty)
            && self.inputs.iter().all(|p| p.occupancy() == 0)
    }
}

/// Integer unit with separate arith, multiply and divide latencies.
#[derive(Debug)]
pub struct AluUnit {
    pipes: Pipelines,
}

impl AluUnit {
    pub fn new(config: &CoreConfig) -> Self {
        let latencies = [config.alu_latency, config.mul_latency, config.div_latency];
        Self {
            pipes: Pipelines::new(config.issue_width, &latencies, config.pipeline_depth),
        }
    }
}

impl ExeUnit for AluUnit {
    fn exe_type(&self) -> ExeType {
        ExeType::Alu
    }

    fn tick(&mut self, now: Cycle, traces: &mut TraceArena) {
        self.pipes.tick(now, traces, |instr| match instr {
            Instr::Alu { op, .. } => *op as usize,
            _ => AluOp::Arith as usize,
        });
    }

    fn reset(&mut self) {
        self.pipes.reset();
    }

    fn inputs_mut(&mut self) -> &mut [Port<InputPort, TraceId>] {
        &mut self.pipes.inputs
    }

    fn outputs_mut(&mut self) -> &mut [Port<OutputPort, TraceId>] {
        &mut self.pipes.outputs
    }

    fn is_idle(&self) -> bool {
        self.pipes.is_idle()
    }
}

#[derive(Debug)]
pub struct FpuUnit {
    pipes: Pipelines,
}

impl FpuUnit {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            pipes: Pipelines::new(
                config.issue_width,
                &[config.fpu_latency],
                config.pipeline_depth,
            ),
        }
    }
}

impl ExeUnit for FpuUnit {
    fn exe_type(&self) -> ExeType {
        ExeType::Fpu
    }

    fn tick(&mut self, now: Cycle, traces: &mut TraceArena) {
        self.pipes.tick(now, traces, |_| 0);
    }

    fn reset(&mut self) {
        self.pipes.reset();
    }

    fn inputs_mut(&mut self) -> &mut [Port<InputPort, TraceId>] {
        &mut self.pipes.inputs
    }

    fn outputs_mut(&mut self) -> &mut [Port<OutputPort, TraceId>] {
        &mut self.pipes.outputs
    }

    fn is_idle(&self) -> bool {
        self.pipes.is_idle()
    }
}
