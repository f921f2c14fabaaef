// Copyright 2017 TiKV Project Authors. Licensed under Apache-2.0.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures::{future, SinkExt, TryFutureExt, TryStreamExt};
use grpcio::{
    DuplexSink, EnvBuilder, RequestStream, RpcContext, RpcStatus, RpcStatusCode,
    Server as GrpcServer, ServerBuilder, UnarySink, WriteFlags,
};
use kvproto::pdpb::*;
use security::{SecurityConfig, SecurityManager};

use crate::mocker::*;

type MockError = Box<dyn std::error::Error + Send + Sync>;

pub struct Server<C: PdMocker> {
    server: Option<GrpcServer>,
    service: Arc<Service>,
    case: Option<Arc<C>>,
}

impl Server<Service> {
    pub fn new(eps_count: usize) -> Server<Service> {
        let mgr = SecurityManager::new(&SecurityConfig::default()).unwrap();
        let eps = vec![("127.0.0.1".to_owned(), 0); eps_count];
        let case: Option<Arc<Service>> = None;
        Server::with_configuration(&mgr, eps, case)
    }
}

impl<C: PdMocker + Send + Sync + 'static> Server<C> {
    pub fn with_case(eps_count: usize, case: Arc<C>) -> Server<C> {
        let mgr = SecurityManager::new(&SecurityConfig::default()).unwrap();
        let eps = vec![("127.0.0.1".to_owned(), 0); eps_count];
        Server::with_configuration(&mgr, eps, Some(case))
    }

    pub fn with_configuration(
        mgr: &SecurityManager,
        eps: Vec<(String, u16)>,
        case: Option<Arc<C>>,
    ) -> Server<C> {
        let mut server = Server {
            server: None,
            service: Arc::new(Service::new()),
            case,
        };
        server.start(mgr, eps);
        server
    }

    pub fn default_handler(&self) -> &Service {
        &self.service
    }

    fn start(&mut self, mgr: &SecurityManager, eps: Vec<(String, u16)>) {
        let mock = MockPd {
            service: Arc::clone(&self.service),
            case: self.case.clone(),
        };
        let env = Arc::new(EnvBuilder::new().build());
        let mut sb = ServerBuilder::new(env).register_service(create_pd(mock));
        for (host, port) in eps {
            sb = mgr.bind(sb, &host, port);
        }
        let mut server = sb.build().unwrap();

        // Members advertise scheme-qualified urls, the way a real deployment
        // would.
        let addrs: Vec<String> = server
            .bind_addrs()
            .map(|(host, port)| format!("http://{}:{}", host, port))
            .collect();
        self.service.set_endpoints(addrs.clone());
        if let Some(case) = &self.case {
            case.set_endpoints(addrs);
        }

        server.start();
        self.server = Some(server);
        // Give the freshly bound ports a moment to accept connections.
        thread::sleep(Duration::from_millis(300));
    }

    pub fn bind_addrs(&self) -> Vec<(String, u16)> {
        self.server
            .as_ref()
            .unwrap()
            .bind_addrs()
            .map(|(host, port)| (host.clone(), port))
            .collect()
    }
}

struct MockPd<C: PdMocker> {
    service: Arc<Service>,
    case: Option<Arc<C>>,
}

impl<C: PdMocker> Clone for MockPd<C> {
    fn clone(&self) -> Self {
        MockPd {
            service: Arc::clone(&self.service),
            case: self.case.clone(),
        }
    }
}

impl<C: PdMocker> MockPd<C> {
    /// The installed case gets the first say; the default service answers
    /// whatever the case leaves alone.
    fn reply<R>(&self, f: impl Fn(&dyn PdMocker) -> Option<Result<R>>) -> Option<Result<R>> {
        self.case
            .as_ref()
            .and_then(|case| f(case.as_ref()))
            .or_else(|| f(self.service.as_ref()))
    }
}

/// Puts a mocker verdict on the wire. Leadership complaints surface as
/// UNAVAILABLE, the way a retired member turns callers away; other injected
/// failures as FAILED_PRECONDITION; calls nobody mocked as UNIMPLEMENTED.
fn respond<R>(ctx: &RpcContext<'_>, sink: UnarySink<R>, reply: Option<Result<R>>)
where
    R: Send + 'static,
{
    match reply {
        Some(Ok(resp)) => ctx.spawn(
            sink.success(resp)
                .unwrap_or_else(|e| error!("failed to reply: {:?}", e)),
        ),
        Some(Err(err)) => {
            let code = if err.contains("not leader") {
                RpcStatusCode::UNAVAILABLE
            } else {
                RpcStatusCode::FAILED_PRECONDITION
            };
            ctx.spawn(
                sink.fail(RpcStatus::with_message(code, err))
                    .unwrap_or_else(|e| error!("failed to reply: {:?}", e)),
            );
        }
        None => {
            let status = RpcStatus::with_message(
                RpcStatusCode::UNIMPLEMENTED,
                "mock has no answer for this call".to_owned(),
            );
            ctx.spawn(
                sink.fail(status)
                    .unwrap_or_else(|e| error!("failed to reply: {:?}", e)),
            );
        }
    }
}

impl<C: PdMocker + Send + Sync + 'static> Pd for MockPd<C> {
    fn get_members(
        &mut self,
        ctx: RpcContext<'_>,
        req: GetMembersRequest,
        sink: UnarySink<GetMembersResponse>,
    ) {
        let reply = self.reply(|c| c.get_members(&req));
        respond(&ctx, sink, reply);
    }

    fn tso(
        &mut self,
        ctx: RpcContext<'_>,
        req: RequestStream<TsoRequest>,
        resp: DuplexSink<TsoResponse>,
    ) {
        let mock = self.clone();
        ctx.spawn(async move {
            let mut stream = req
                .map_err(|e| -> MockError { Box::new(e) })
                .try_filter_map(move |r| {
                    // An installed case owns the stream: no fallback, and
                    // `None` means the batch is left unanswered.
                    let reply = match mock.case.as_ref() {
                        Some(case) => case.tso(&r),
                        None => mock.service.tso(&r),
                    };
                    let reply = match reply {
                        None => Ok(None),
                        Some(Ok(resp)) => Ok(Some((resp, WriteFlags::default()))),
                        Some(Err(e)) => Err(MockError::from(e)),
                    };
                    future::ready(reply)
                });
            let mut sink = resp.sink_map_err(|e| -> MockError { Box::new(e) });
            let _ = sink.send_all(&mut stream).await;
            let _ = sink.close().await;
        });
    }

    fn get_region(
        &mut self,
        ctx: RpcContext<'_>,
        req: GetRegionRequest,
        sink: UnarySink<GetRegionResponse>,
    ) {
        let reply = self.reply(|c| c.get_region(&req));
        respond(&ctx, sink, reply);
    }

    fn get_prev_region(
        &mut self,
        ctx: RpcContext<'_>,
        req: GetRegionRequest,
        sink: UnarySink<GetRegionResponse>,
    ) {
        let reply = self.reply(|c| c.get_prev_region(&req));
        respond(&ctx, sink, reply);
    }

    fn get_region_by_id(
        &mut self,
        ctx: RpcContext<'_>,
        req: GetRegionByIdRequest,
        sink: UnarySink<GetRegionResponse>,
    ) {
        let reply = self.reply(|c| c.get_region_by_id(&req));
        respond(&ctx, sink, reply);
    }

    fn scan_regions(
        &mut self,
        ctx: RpcContext<'_>,
        req: ScanRegionsRequest,
        sink: UnarySink<ScanRegionsResponse>,
    ) {
        let reply = self.reply(|c| c.scan_regions(&req));
        respond(&ctx, sink, reply);
    }

    fn get_store(
        &mut self,
        ctx: RpcContext<'_>,
        req: GetStoreRequest,
        sink: UnarySink<GetStoreResponse>,
    ) {
        let reply = self.reply(|c| c.get_store(&req));
        respond(&ctx, sink, reply);
    }

    fn get_all_stores(
        &mut self,
        ctx: RpcContext<'_>,
        req: GetAllStoresRequest,
        sink: UnarySink<GetAllStoresResponse>,
    ) {
        let reply = self.reply(|c| c.get_all_stores(&req));
        respond(&ctx, sink, reply);
    }

    fn update_gc_safe_point(
        &mut self,
        ctx: RpcContext<'_>,
        req: UpdateGcSafePointRequest,
        sink: UnarySink<UpdateGcSafePointResponse>,
    ) {
        let reply = self.reply(|c| c.update_gc_safe_point(&req));
        respond(&ctx, sink, reply);
    }

    fn scatter_region(
        &mut self,
        ctx: RpcContext<'_>,
        req: ScatterRegionRequest,
        sink: UnarySink<ScatterRegionResponse>,
    ) {
        let reply = self.reply(|c| c.scatter_region(&req));
        respond(&ctx, sink, reply);
    }

    fn get_operator(
        &mut self,
        ctx: RpcContext<'_>,
        req: GetOperatorRequest,
        sink: UnarySink<GetOperatorResponse>,
    ) {
        let reply = self.reply(|c| c.get_operator(&req));
        respond(&ctx, sink, reply);
    }
}
