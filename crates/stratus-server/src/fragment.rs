//! Executor-side fragment control: the fragment registry and the four
//! peer-facing handlers (ExecPlanFragment, ReportExecStatus,
//! CancelPlanFragment, TransmitData). Handlers return wire statuses, never
//! errors; the transport forwards them verbatim.

use std::sync::Arc;

use tracing::{debug, error, info};

use stratus_common::status::StatusWire;
use stratus_common::wire::{
    CancelPlanFragmentParams, ExecPlanFragmentParams, FragmentInstanceCtx, FragmentInstanceId,
    ReportExecStatusParams, TransmitDataParams,
};
use stratus_common::QueryStatus;

use crate::env::FragmentExec;
use crate::metrics;
use crate::server::ControlServer;

/// Executor-side state of one fragment instance. The registry entry lives
/// from successful Prepare until the worker task finishes.
pub struct FragmentExecState {
    instance_ctx: FragmentInstanceCtx,
    exec: Arc<dyn FragmentExec>,
}

impl FragmentExecState {
    pub fn fragment_instance_id(&self) -> FragmentInstanceId {
        self.instance_ctx.fragment_instance_id
    }

    pub fn query_id(&self) -> stratus_common::wire::QueryId {
        self.instance_ctx.query_id
    }

    pub fn backend_num(&self) -> i32 {
        self.instance_ctx.backend_num
    }

    /// Fire-and-forget cancellation; the worker cleans the registry up.
    pub fn cancel(&self) {
        self.exec.cancel();
    }
}

impl ControlServer {
    /// Start executing a plan fragment shipped by a peer coordinator.
    pub async fn exec_plan_fragment(&self, params: ExecPlanFragmentParams) -> StatusWire {
        info!(
            instance_id = %params.instance_ctx.fragment_instance_id,
            coord = ?params.instance_ctx.coord_address,
            backend_num = params.instance_ctx.backend_num,
            "ExecPlanFragment"
        );
        self.start_plan_fragment_execution(params).await.to_wire()
    }

    async fn start_plan_fragment_execution(&self, params: ExecPlanFragmentParams) -> QueryStatus {
        if params.fragment.output_sink.is_none() {
            return QueryStatus::error("missing sink in plan fragment");
        }

        let exec = self.env.fragment_exec_factory.create(&params.instance_ctx);
        let exec_state = Arc::new(FragmentExecState {
            instance_ctx: params.instance_ctx.clone(),
            exec: exec.clone(),
        });

        // Prepare before registering: the executor requires that Cancel()
        // is never observed before Prepare() returns, and cancellation is
        // only reachable through the registry.
        let prepare_status = exec_state.exec.prepare(&params).await;
        if !prepare_status.is_ok() {
            return prepare_status;
        }

        let instance_id = exec_state.fragment_instance_id();
        self.fragment_exec_state_map.insert(instance_id, exec_state);

        // Run the fragment on its own worker; the worker owns the registry
        // entry's removal.
        let map = Arc::clone(&self.fragment_exec_state_map);
        tokio::spawn(async move {
            metrics::NUM_FRAGMENTS.inc();
            let status = exec.exec().await;
            if !status.is_ok() {
                debug!(instance_id = %instance_id, "Fragment finished with error: {}", status.message());
            }
            if map.remove(&instance_id).is_none() {
                error!(
                    instance_id = %instance_id,
                    "missing entry in fragment exec state map"
                );
            }
        });

        QueryStatus::ok()
    }

    /// A peer executor reporting status for a fragment of a query this
    /// daemon coordinates. Routed by query id, not fragment id.
    pub async fn report_exec_status(&self, params: &ReportExecStatusParams) -> StatusWire {
        debug!(
            query_id = %params.query_id,
            backend_num = params.backend_num,
            instance_id = %params.fragment_instance_id,
            done = params.done,
            "ReportExecStatus"
        );
        let exec_state = match self.get_query_exec_state(&params.query_id) {
            Some(exec_state) => exec_state,
            None => {
                // Expected occasionally: a report RPC can be in flight
                // while cancellation tears the query down.
                let err = format!(
                    "ReportExecStatus(): Received report for unknown query ID (probably closed \
                     or cancelled). (query_id: {}, backend: {}, instance: {} done: {})",
                    params.query_id, params.backend_num, params.fragment_instance_id, params.done
                );
                info!("{}", err);
                return QueryStatus::error(err).to_wire();
            }
        };
        let coordinator = exec_state.inner().lock().await.coordinator.clone();
        match coordinator {
            Some(coordinator) => coordinator.update_fragment_exec_status(params).to_wire(),
            None => QueryStatus::error(format!(
                "ReportExecStatus(): query {} has not started execution",
                params.query_id
            ))
            .to_wire(),
        }
    }

    /// Initiate cancellation of a fragment instance. The registry entry
    /// and the exec state are removed when the worker finishes.
    pub fn cancel_plan_fragment(&self, params: &CancelPlanFragmentParams) -> StatusWire {
        info!(instance_id = %params.fragment_instance_id, "CancelPlanFragment");
        match self.get_fragment_exec_state(&params.fragment_instance_id) {
            Some(exec_state) => {
                exec_state.cancel();
                QueryStatus::ok().to_wire()
            }
            None => QueryStatus::error(format!(
                "unknown fragment id: {}",
                params.fragment_instance_id
            ))
            .to_wire(),
        }
    }

    /// Row data addressed to a fragment instance on this node.
    pub async fn transmit_data(&self, params: &TransmitDataParams) -> StatusWire {
        debug!(
            instance_id = %params.dest_fragment_instance_id,
            node_id = params.dest_node_id,
            sender_id = params.sender_id,
            rows = params.row_batch.num_rows,
            eos = params.eos,
            "TransmitData"
        );
        if params.row_batch.num_rows > 0 {
            let status = self
                .env
                .stream_mgr
                .add_data(
                    params.dest_fragment_instance_id,
                    params.dest_node_id,
                    params.sender_id,
                    &params.row_batch,
                )
                .await;
            if !status.is_ok() {
                return status.to_wire();
            }
        }
        if params.eos {
            return self
                .env
                .stream_mgr
                .close_sender(
                    params.dest_fragment_instance_id,
                    params.dest_node_id,
                    params.sender_id,
                )
                .await
                .to_wire();
        }
        QueryStatus::ok().to_wire()
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::TestDaemon;
    use stratus_common::status::StatusCode;
    use stratus_common::wire::CancelPlanFragmentParams;

    #[tokio::test]
    async fn test_exec_plan_fragment_registers_and_completes() {
        let daemon = TestDaemon::builder().build();
        let params = daemon.fragment_params();
        let instance_id = params.instance_ctx.fragment_instance_id;

        let result = daemon.server.exec_plan_fragment(params).await;
        assert_eq!(result.status_code, StatusCode::Ok);
        assert!(daemon.server.get_fragment_exec_state(&instance_id).is_some());

        // Let the fragment run to completion; the worker erases the entry.
        daemon.release_fragment(&instance_id);
        daemon.wait_for_fragment_removal(&instance_id).await;
    }

    #[tokio::test]
    async fn test_exec_plan_fragment_requires_sink() {
        let daemon = TestDaemon::builder().build();
        let mut params = daemon.fragment_params();
        params.fragment.output_sink = None;

        let result = daemon.server.exec_plan_fragment(params).await;
        assert_eq!(result.status_code, StatusCode::InternalError);
        assert_eq!(result.error_msgs, vec!["missing sink in plan fragment"]);
    }

    #[tokio::test]
    async fn test_prepare_failure_leaves_no_registry_entry() {
        let daemon = TestDaemon::builder().build();
        daemon.fragments.fail_prepare("prepare exploded");
        let params = daemon.fragment_params();
        let instance_id = params.instance_ctx.fragment_instance_id;

        let result = daemon.server.exec_plan_fragment(params).await;
        assert_eq!(result.status_code, StatusCode::InternalError);
        assert!(daemon.server.get_fragment_exec_state(&instance_id).is_none());
    }

    #[tokio::test]
    async fn test_cancel_plan_fragment() {
        let daemon = TestDaemon::builder().build();
        let params = daemon.fragment_params();
        let instance_id = params.instance_ctx.fragment_instance_id;
        daemon.server.exec_plan_fragment(params).await;

        let result = daemon
            .server
            .cancel_plan_fragment(&CancelPlanFragmentParams { fragment_instance_id: instance_id });
        assert_eq!(result.status_code, StatusCode::Ok);
        // Cancellation unblocks the fragment; the worker cleans up.
        daemon.wait_for_fragment_removal(&instance_id).await;

        // Unknown ids are an error.
        let result = daemon.server.cancel_plan_fragment(&CancelPlanFragmentParams {
            fragment_instance_id: uuid::Uuid::new_v4(),
        });
        assert_eq!(result.status_code, StatusCode::InternalError);
        assert!(result.error_msgs[0].starts_with("unknown fragment id"));
    }

    #[tokio::test]
    async fn test_report_exec_status_routes_to_coordinator() {
        let daemon = TestDaemon::builder().build();
        let (state, _session) = daemon.start_query("select 1").await;

        let report = daemon.report_for(&state.query_id());
        let result = daemon.server.report_exec_status(&report).await;
        assert_eq!(result.status_code, StatusCode::Ok);
        assert_eq!(daemon.coordinator_report_count(&state.query_id()), 1);
    }

    #[tokio::test]
    async fn test_transmit_data_appends_then_closes_on_eos() {
        let daemon = TestDaemon::builder().build();
        let mut params = daemon.transmit_params(3);
        daemon.server.transmit_data(&params).await;
        assert_eq!(daemon.streams.batches_added(), 1);
        assert_eq!(daemon.streams.senders_closed(), 0);

        params.eos = true;
        params.row_batch.num_rows = 0;
        daemon.server.transmit_data(&params).await;
        assert_eq!(daemon.streams.batches_added(), 1);
        assert_eq!(daemon.streams.senders_closed(), 1);
    }

    #[tokio::test]
    async fn test_transmit_data_surfaces_stream_errors() {
        let daemon = TestDaemon::builder().build();
        daemon.streams.fail_with("exchange torn down");
        let params = daemon.transmit_params(3);
        let result = daemon.server.transmit_data(&params).await;
        assert_eq!(result.status_code, StatusCode::InternalError);
        assert_eq!(result.error_msgs, vec!["exchange torn down"]);
    }
}
