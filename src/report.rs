use std::collections::BTreeMap;
use std::io;

use serde::Serialize;

use crate::analysis::delay::{ScaleMap, metric_name};
use crate::state::{CallTree, CallpathId, EventRef, MetricId};

#[derive(Debug, Clone, Serialize)]
pub struct WaitCostRecord {
    pub callpath: CallpathId,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DelayCostRecord {
    pub metric: &'static str,
    pub callpath: CallpathId,
    pub cost: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScaleRecord {
    pub metric: &'static str,
    pub synchpoint: EventRef,
    pub sum: f64,
    pub max: f64,
}

/// Flattened, serializable view of one rank's report.
#[derive(Debug, Serialize)]
pub struct ReportRecords {
    pub total_wait: f64,
    pub wait_costs: Vec<WaitCostRecord>,
    pub delay_costs: Vec<DelayCostRecord>,
    pub scales: Vec<ScaleRecord>,
}

/// Accumulated results of one rank's analysis. Wait costs are rank-local;
/// delay costs and scale maps accumulate on the ranks that acted as delay
/// roots.
#[derive(Debug, Default)]
pub struct AnalysisReport {
    pub delay_costs: BTreeMap<MetricId, BTreeMap<CallpathId, f64>>,
    pub sum_scales: BTreeMap<MetricId, ScaleMap>,
    pub max_scales: BTreeMap<MetricId, ScaleMap>,
    pub wait_costs: BTreeMap<CallpathId, f64>,
    pub total_wait: f64,
}

impl AnalysisReport {
    pub fn records(&self) -> ReportRecords {
        let wait_costs = self
            .wait_costs
            .iter()
            .map(|(cp, cost)| WaitCostRecord {
                callpath: *cp,
                cost: *cost,
            })
            .collect();
        let delay_costs = self
            .delay_costs
            .iter()
            .flat_map(|(metric, costs)| {
                costs.iter().map(|(cp, cost)| DelayCostRecord {
                    metric: metric_name(*metric),
                    callpath: *cp,
                    cost: *cost,
                })
            })
            .collect();
        let mut scales = Vec::new();
        for (metric, sums) in &self.sum_scales {
            for (sp, sum) in sums {
                let max = self
                    .max_scales
                    .get(metric)
                    .and_then(|m| m.get(sp))
                    .copied()
                    .unwrap_or(0.0);
                scales.push(ScaleRecord {
                    metric: metric_name(*metric),
                    synchpoint: *sp,
                    sum: *sum,
                    max,
                });
            }
        }
        ReportRecords {
            total_wait: self.total_wait,
            wait_costs,
            delay_costs,
            scales,
        }
    }

    pub fn emit_json<W: io::Write>(&self, writer: W) -> serde_json::Result<()> {
        serde_json::to_writer_pretty(writer, &self.records())
    }

    /// Human-readable summary, most expensive call paths first.
    pub fn print_statistics(&self, calltree: &CallTree) {
        println!("Wait-state costs (total {:.6}s):", self.total_wait);
        let mut waits: Vec<_> = self.wait_costs.iter().collect();
        waits.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap().then(a.0.cmp(b.0)));
        for (cp, cost) in waits {
            let region = calltree.node(*cp).region;
            println!("  {:>12.6}s  callpath {} (region {})", cost, cp.0, region.0);
        }
        for (metric, costs) in &self.delay_costs {
            println!("Delay costs [{}]:", metric_name(*metric));
            let mut rows: Vec<_> = costs.iter().collect();
            rows.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap().then(a.0.cmp(b.0)));
            for (cp, cost) in rows {
                let region = calltree.node(*cp).region;
                println!("  {:>12.6}s  callpath {} (region {})", cost, cp.0, region.0);
            }
        }
        for (metric, sums) in &self.sum_scales {
            println!("Propagation scales [{}]:", metric_name(*metric));
            for (sp, sum) in sums {
                let max = self
                    .max_scales
                    .get(metric)
                    .and_then(|m| m.get(sp))
                    .copied()
                    .unwrap_or(0.0);
                println!("  synchpoint {}: sum {:.6}, max {:.6}", sp, sum, max);
            }
        }
    }
}
