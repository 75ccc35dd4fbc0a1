//! Work-order domain module.
//!
//! Pure domain logic (no IO): line items, discount and tax, the cost rollup
//! formula, and the status lifecycle that freezes a work order once invoiced.

pub mod cost;
pub mod work_order;

pub use cost::{compute_costs, CostBreakdown, CostError, CostInputs, Discount, DiscountType};
pub use work_order::{
    FeeLine, FeeType, LaborLine, LineId, NewFeeLine, NewLaborLine, NewPartLine, OpenWorkOrder,
    PartLine, PartLineStatus, Priority, StockIssue, WorkOrder, WorkOrderError, WorkOrderKind,
    WorkOrderStatus,
};
