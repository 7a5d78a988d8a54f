#![allow(clippy::trivial_regex)]

use std::{
    collections::HashMap,
    convert::Infallible,
    future::ready,
    net::{IpAddr, SocketAddr, TcpListener},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, OnceLock,
    },
};

use actix_http::{HttpService, Method, Request, Response, StatusCode};
use actix_server::{Server, ServerHandle};
use actix_web::body::BoxBody;
use async_trait::async_trait;
use der::{Decode as _, EncodePem as _};
use eyre::eyre;
use parking_lot::Mutex;
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use regex::Regex;
use time::{Duration, OffsetDateTime};

use crate::{
    account::Account,
    challenge::{DnsProvider, PrecheckConfig, TxtResolver},
    client::{api, AccountKey, AcmeClient, Dns01Solver, OrderRequest, Registration, RevocationReason},
    config::ExternalAccountBinding,
    domain::challenge_record_fqdn,
};

static RE_URL: OnceLock<Regex> = OnceLock::new();

fn re_url() -> &'static Regex {
    RE_URL.get_or_init(|| regex::Regex::new("<URL>").unwrap())
}

const NONCE: &str = "8_uBBV3N2DBRJczhoiB46ugJKUkUHxGzVe6xIMpjHFM";

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn to_pem(der: &[u8]) -> String {
    x509_cert::Certificate::from_der(der)
        .unwrap()
        .to_pem(pem::LineEnding::LF)
        .unwrap()
}

/// Two-level CA issuing real certificates.
pub struct TestCa {
    root: rcgen::Certificate,
    intermediate: rcgen::Certificate,
    intermediate_key: KeyPair,
}

impl TestCa {
    pub fn new() -> Self {
        fn ca_params(name: &str) -> CertificateParams {
            let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.distinguished_name = DistinguishedName::new();
            params.distinguished_name.push(DnType::CommonName, name);
            params
        }

        let root_key = KeyPair::generate().unwrap();
        let root = ca_params("Test Root").self_signed(&root_key).unwrap();

        let intermediate_key = KeyPair::generate().unwrap();
        let intermediate = ca_params("Test Intermediate")
            .signed_by(&intermediate_key, &root, &root_key)
            .unwrap();

        Self {
            root,
            intermediate,
            intermediate_key,
        }
    }

    /// Issues a leaf for `domains` and returns it followed by the intermediate, as a CA would.
    pub fn issue(
        &self,
        domains: &[String],
        not_before: OffsetDateTime,
        not_after: OffsetDateTime,
    ) -> String {
        let mut params = CertificateParams::new(domains.to_vec()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, domains[0].as_str());
        params.not_before = not_before;
        params.not_after = not_after;

        let leaf_key = KeyPair::generate().unwrap();
        let leaf = params
            .signed_by(&leaf_key, &self.intermediate, &self.intermediate_key)
            .unwrap();

        format!("{}{}", to_pem(leaf.der()), self.intermediate_pem())
    }

    pub fn intermediate_pem(&self) -> String {
        to_pem(self.intermediate.der())
    }

    pub fn root_pem(&self) -> String {
        to_pem(self.root.der())
    }

    pub fn root_der(&self) -> Vec<u8> {
        self.root.der().to_vec()
    }
}

/// Mutable state of the mock CA.
pub struct MockState {
    /// Served from the certificate URL.
    pub chain: String,
    pub challenge_posted: bool,
    pub fail_challenge: bool,
    pub finalized: bool,
    pub revocations: usize,
}

impl MockState {
    fn authz_status(&self) -> &'static str {
        match (self.challenge_posted, self.fail_challenge) {
            (false, _) => "pending",
            (true, false) => "valid",
            (true, true) => "invalid",
        }
    }

    fn order_status(&self) -> &'static str {
        if self.finalized {
            return "valid";
        }

        match self.authz_status() {
            "valid" => "ready",
            "invalid" => "invalid",
            _ => "pending",
        }
    }
}

pub struct TestServer {
    pub url: String,
    pub dir_url: String,
    pub state: Arc<Mutex<MockState>>,
    pub ca: TestCa,
    handle: ServerHandle,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        drop(self.handle.stop(false));
    }
}

fn reply(status: StatusCode, body: String) -> Response<BoxBody> {
    Response::build(status)
        .insert_header(("Replay-Nonce", NONCE))
        .insert_header(("Content-Type", "application/json"))
        .body(body)
        .map_into_boxed_body()
}

fn get_directory(url: &str) -> Response<BoxBody> {
    const BODY: &str = r#"{
    "keyChange": "<URL>/acme/key-change",
    "newAccount": "<URL>/acme/new-acct",
    "newNonce": "<URL>/acme/new-nonce",
    "newOrder": "<URL>/acme/new-order",
    "revokeCert": "<URL>/acme/revoke-cert",
    "meta": {
        "caaIdentities": [
        "testdir.org"
        ]
    }
    }"#;

    reply(StatusCode::OK, re_url().replace_all(BODY, url).into_owned())
}

fn head_new_nonce() -> Response<BoxBody> {
    Response::build(StatusCode::NO_CONTENT)
        .insert_header(("Replay-Nonce", NONCE))
        .finish()
        .map_into_boxed_body()
}

fn post_new_acct(url: &str) -> Response<BoxBody> {
    const BODY: &str = r#"{
    "id": 7728515,
    "key": {
        "use": "sig",
        "kty": "EC",
        "crv": "P-256",
        "alg": "ES256",
        "x": "ttpobTRK2bw7ttGBESRO7Nb23mbIRfnRZwunL1W6wRI",
        "y": "h2Z00J37_2qRKH0-flrHEsH0xbit915Tyvd2v_CAOSk"
    },
    "contact": [
        "mailto:foo@bar.com"
    ],
    "initialIp": "90.171.37.12",
    "createdAt": "2018-12-31T17:15:40.399104457Z",
    "status": "valid"
    }"#;

    let location = re_url()
        .replace_all("<URL>/acme/acct/7728515", url)
        .into_owned();

    let mut res = reply(StatusCode::CREATED, BODY.to_owned());
    res.headers_mut().insert(
        actix_http::header::LOCATION,
        location.parse().unwrap(),
    );
    res
}

fn order_body(url: &str, status: &str) -> String {
    const BODY: &str = r#"{
    "status": "<STATUS>",
    "expires": "2019-01-09T08:26:43.570360537Z",
    "identifiers": [
        {
        "type": "dns",
        "value": "acme-test.example.com"
        }
    ],
    "authorizations": [
        "<URL>/acme/authz/YTqpYUthlVfwBncUufE8IRWLMSRqcSs"
    ],
    "finalize": "<URL>/acme/finalize/7738992/18234324",
    "certificate": "<URL>/acme/cert/fae41c070f967713109028"
    }"#;

    re_url()
        .replace_all(BODY, url)
        .replace("<STATUS>", status)
}

fn post_new_order(url: &str) -> Response<BoxBody> {
    let location = re_url()
        .replace_all("<URL>/acme/order/YTqpYUthlVfwBncUufE8", url)
        .into_owned();

    let mut res = reply(StatusCode::CREATED, order_body(url, "pending"));
    res.headers_mut().insert(
        actix_http::header::LOCATION,
        location.parse().unwrap(),
    );
    res
}

fn post_get_order(url: &str, state: &MockState) -> Response<BoxBody> {
    reply(StatusCode::OK, order_body(url, state.order_status()))
}

fn challenge_body(url: &str, state: &MockState) -> String {
    const BODY: &str = r#"{
            "type": "dns-01",
            "status": "<STATUS>",
            "url": "<URL>/acme/challenge/YTqpYUthlVfwBncUufE8IRWLMSRqcSs/216789599",
            "token": "RRo2ZcXAEqxKvMH8RGcATjSK1KknLEUmauwfQ5i3gG8"<ERROR>
        }"#;

    let error = if state.authz_status() == "invalid" {
        r#",
            "error": {
                "type": "urn:ietf:params:acme:error:unauthorized",
                "detail": "No TXT record found at _acme-challenge.acme-test.example.com"
            }"#
    } else {
        ""
    };

    re_url()
        .replace_all(BODY, url)
        .replace("<STATUS>", state.authz_status())
        .replace("<ERROR>", error)
}

fn post_authz(url: &str, state: &MockState) -> Response<BoxBody> {
    const BODY: &str = r#"{
        "identifier": {
            "type": "dns",
            "value": "acme-test.example.com"
        },
        "status": "<STATUS>",
        "expires": "2019-01-09T08:26:43Z",
        "challenges": [
        {
            "type": "http-01",
            "status": "pending",
            "url": "<URL>/acme/challenge/YTqpYUthlVfwBncUufE8IRWLMSRqcSs/216789597",
            "token": "MUi-gqeOJdRkSb_YR2eaMxQBqf6al8dgt_dOttSWb0w"
        },
        <CHALLENGE>
        ]
    }"#;

    let body = re_url()
        .replace_all(BODY, url)
        .replace("<STATUS>", state.authz_status())
        .replace("<CHALLENGE>", &challenge_body(url, state));

    reply(StatusCode::OK, body)
}

fn post_challenge(url: &str, state: &mut MockState) -> Response<BoxBody> {
    state.challenge_posted = true;
    reply(StatusCode::OK, challenge_body(url, state))
}

fn post_finalize(url: &str, state: &mut MockState) -> Response<BoxBody> {
    state.finalized = true;
    reply(StatusCode::OK, order_body(url, state.order_status()))
}

fn post_certificate(state: &MockState) -> Response<BoxBody> {
    Response::build(StatusCode::OK)
        .insert_header(("Replay-Nonce", NONCE))
        .insert_header(("Content-Type", "application/pem-certificate-chain"))
        .body(state.chain.clone())
        .map_into_boxed_body()
}

fn post_revoke_cert(state: &mut MockState) -> Response<BoxBody> {
    state.revocations += 1;
    Response::build(StatusCode::OK)
        .insert_header(("Replay-Nonce", NONCE))
        .finish()
        .map_into_boxed_body()
}

struct Routes {
    url: String,
    state: Arc<Mutex<MockState>>,
    root_pem: String,
    root_der: Vec<u8>,
}

fn route_request(req: Request, routes: &Routes) -> Response<BoxBody> {
    let url = routes.url.as_str();
    let mut state = routes.state.lock();

    match (req.method(), req.path()) {
        (&Method::GET, "/directory") => get_directory(url),
        (&Method::HEAD, "/acme/new-nonce") => head_new_nonce(),
        (&Method::POST, "/acme/new-acct") => post_new_acct(url),
        (&Method::POST, "/acme/new-order") => post_new_order(url),
        (&Method::POST, "/acme/order/YTqpYUthlVfwBncUufE8") => post_get_order(url, &state),
        (&Method::POST, "/acme/authz/YTqpYUthlVfwBncUufE8IRWLMSRqcSs") => post_authz(url, &state),

        (&Method::POST, "/acme/challenge/YTqpYUthlVfwBncUufE8IRWLMSRqcSs/216789599") => {
            post_challenge(url, &mut state)
        }

        (&Method::POST, "/acme/finalize/7738992/18234324") => post_finalize(url, &mut state),
        (&Method::POST, "/acme/cert/fae41c070f967713109028") => post_certificate(&state),
        (&Method::POST, "/acme/revoke-cert") => post_revoke_cert(&mut state),

        (&Method::GET, "/root.pem") => Response::build(StatusCode::OK)
            .body(routes.root_pem.clone())
            .map_into_boxed_body(),

        (&Method::GET, "/root.der") => Response::build(StatusCode::OK)
            .body(routes.root_der.clone())
            .map_into_boxed_body(),

        (_, _) => Response::build(StatusCode::NOT_FOUND)
            .finish()
            .map_into_boxed_body(),
    }
}

/// Starts a mock CA whose certificate URL serves a chain for `acme-test.example.com`.
pub fn with_directory_server() -> TestServer {
    let lst = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = lst.local_addr().unwrap().port();

    let url = format!("http://127.0.0.1:{port}");
    let dir_url = format!("{url}/directory");

    let ca = TestCa::new();
    let now = OffsetDateTime::now_utc();
    let chain = ca.issue(
        &["acme-test.example.com".to_owned()],
        now - Duration::hours(1),
        now + Duration::days(90),
    );

    let state = Arc::new(Mutex::new(MockState {
        chain,
        challenge_posted: false,
        fail_challenge: false,
        finalized: false,
        revocations: 0,
    }));

    let routes = Arc::new(Routes {
        url: url.clone(),
        state: Arc::clone(&state),
        root_pem: ca.root_pem(),
        root_der: ca.root_der(),
    });

    let server = Server::build()
        .listen("acme", lst, move || {
            let routes = Arc::clone(&routes);

            HttpService::build()
                .finish(move |req| ready(Ok::<_, Infallible>(route_request(req, &routes))))
                .tcp()
        })
        .unwrap()
        .workers(1)
        .run();

    let handle = server.handle();

    tokio::spawn(server);

    TestServer {
        url,
        dir_url,
        state,
        ca,
        handle,
    }
}

/// Records solver calls as `"present <domain> <token>"` and `"cleanup <domain> <token>"`.
#[derive(Default)]
pub struct RecordingSolver {
    events: Mutex<Vec<String>>,
}

impl RecordingSolver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl Dns01Solver for RecordingSolver {
    async fn present(&self, domain: &str, token: &str, _key_auth: &str) -> eyre::Result<()> {
        self.events.lock().push(format!("present {domain} {token}"));
        Ok(())
    }

    async fn cleanup(&self, domain: &str, token: &str, _key_auth: &str) -> eyre::Result<()> {
        self.events.lock().push(format!("cleanup {domain} {token}"));
        Ok(())
    }
}

/// In-process CA that answers orders through the given solver.
pub struct FakeAcmeClient {
    pub registrations: AtomicUsize,
    pub fail_register: AtomicBool,
    pub obtained: AtomicUsize,
    revoked: Mutex<Vec<String>>,
    ca: TestCa,
}

impl FakeAcmeClient {
    pub fn new() -> Self {
        Self {
            registrations: AtomicUsize::new(0),
            fail_register: AtomicBool::new(false),
            obtained: AtomicUsize::new(0),
            revoked: Mutex::new(Vec::new()),
            ca: TestCa::new(),
        }
    }

    /// Certificates passed to `revoke`, in order.
    pub fn revoked(&self) -> Vec<String> {
        self.revoked.lock().clone()
    }
}

#[async_trait]
impl AcmeClient for FakeAcmeClient {
    async fn register(
        &self,
        _key: &AccountKey,
        email: &str,
        _eab: Option<&ExternalAccountBinding>,
    ) -> eyre::Result<Registration> {
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(eyre!("account registration rejected"));
        }

        let id = self.registrations.fetch_add(1, Ordering::SeqCst) + 1;

        Ok(Registration {
            uri: format!("https://ca.test/acme/acct/{id}"),
            body: api::Account {
                status: Some("valid".to_owned()),
                contact: Some(vec![format!("mailto:{email}")]),
                ..Default::default()
            },
        })
    }

    async fn obtain(
        &self,
        account: &Account,
        order: &OrderRequest<'_>,
        solver: &dyn Dns01Solver,
    ) -> eyre::Result<String> {
        let thumbprint = account.key.key_id()?.rsplit('/').next().unwrap_or_default();

        let mut presented = Vec::new();
        let mut result = Ok(());

        for (i, domain) in order.domains.iter().enumerate() {
            let token = format!("token-{i}");
            let key_auth = format!("{token}.{thumbprint}");
            presented.push((domain, token.clone(), key_auth.clone()));

            if let Err(err) = solver.present(domain, &token, &key_auth).await {
                result = Err(err);
                break;
            }
        }

        for (domain, token, key_auth) in &presented {
            let _ = solver.cleanup(domain, token, key_auth).await;
        }

        result?;

        self.obtained.fetch_add(1, Ordering::SeqCst);

        let now = OffsetDateTime::now_utc();
        let not_after = order.not_after.unwrap_or(now + Duration::days(90));

        Ok(self
            .ca
            .issue(order.domains, now - Duration::minutes(1), not_after))
    }

    async fn revoke(
        &self,
        _account: &Account,
        certificate_pem: &str,
        _reason: RevocationReason,
    ) -> eyre::Result<()> {
        self.revoked.lock().push(certificate_pem.to_owned());
        Ok(())
    }
}

#[derive(Default)]
struct DnsState {
    txt: HashMap<String, Vec<String>>,
    a: HashMap<String, (u32, IpAddr)>,
    history: Vec<String>,
    lookups: Vec<(Option<SocketAddr>, String)>,
    hidden_lookups: usize,
    lookup_delay: std::time::Duration,
}

/// A DNS zone shared by fake providers and a fake resolver.
#[derive(Clone, Default)]
pub struct FakeDns {
    state: Arc<Mutex<DnsState>>,
}

impl FakeDns {
    pub fn provider(&self, name: &str) -> FakeDnsProvider {
        FakeDnsProvider {
            name: name.to_owned(),
            state: Arc::clone(&self.state),
            precheck: PrecheckConfig::default(),
            failing: None,
        }
    }

    pub fn resolver(&self) -> FakeResolver {
        FakeResolver {
            state: Arc::clone(&self.state),
        }
    }

    pub fn txt(&self, fqdn: &str) -> Vec<String> {
        self.state.lock().txt.get(fqdn).cloned().unwrap_or_default()
    }

    pub fn add_txt(&self, fqdn: &str, value: &str) {
        self.state
            .lock()
            .txt
            .entry(fqdn.to_owned())
            .or_default()
            .push(value.to_owned());
    }

    /// Makes the next `n` lookups come back empty.
    pub fn hide_for_lookups(&self, n: usize) {
        self.state.lock().hidden_lookups = n;
    }

    /// Makes every lookup take `delay` before answering.
    pub fn delay_lookups(&self, delay: std::time::Duration) {
        self.state.lock().lookup_delay = delay;
    }

    pub fn lookups(&self) -> Vec<(Option<SocketAddr>, String)> {
        self.state.lock().lookups.clone()
    }

    /// Every challenge record ever written, in order.
    pub fn history(&self) -> Vec<String> {
        self.state.lock().history.clone()
    }
}

pub struct FakeDnsProvider {
    name: String,
    state: Arc<Mutex<DnsState>>,
    precheck: PrecheckConfig,
    failing: Option<String>,
}

impl FakeDnsProvider {
    pub fn with_precheck(mut self, precheck: PrecheckConfig) -> Self {
        self.precheck = precheck;
        self
    }

    /// Rejects challenge records of `domain`.
    pub fn failing_for(mut self, domain: &str) -> Self {
        self.failing = Some(domain.to_owned());
        self
    }
}

#[async_trait]
impl DnsProvider for FakeDnsProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn precheck_config(&self) -> PrecheckConfig {
        self.precheck.clone()
    }

    async fn set_record_acme_challenge(&self, domain: &str, value: &str) -> eyre::Result<()> {
        if self.failing.as_deref() == Some(domain) {
            return Err(eyre!("zone rejected update of {domain}"));
        }

        let fqdn = challenge_record_fqdn(domain);
        let mut state = self.state.lock();
        state.history.push(fqdn.clone());
        state.txt.entry(fqdn).or_default().push(value.to_owned());
        Ok(())
    }

    async fn delete_record_acme_challenge(&self, domain: &str) -> eyre::Result<()> {
        self.state.lock().txt.remove(&challenge_record_fqdn(domain));
        Ok(())
    }

    async fn set_record_a(&self, domain: &str, ttl: u32, ip: IpAddr) -> eyre::Result<()> {
        self.state.lock().a.insert(domain.to_owned(), (ttl, ip));
        Ok(())
    }

    async fn delete_record_a(&self, domain: &str) -> eyre::Result<()> {
        self.state.lock().a.remove(domain);
        Ok(())
    }
}

pub struct FakeResolver {
    state: Arc<Mutex<DnsState>>,
}

#[async_trait]
impl TxtResolver for FakeResolver {
    async fn lookup_txt(
        &self,
        nameserver: Option<SocketAddr>,
        fqdn: &str,
    ) -> eyre::Result<Vec<String>> {
        let delay = {
            let mut state = self.state.lock();
            state.lookups.push((nameserver, fqdn.to_owned()));
            state.lookup_delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        if state.hidden_lookups > 0 {
            state.hidden_lookups -= 1;
            return Ok(Vec::new());
        }

        Ok(state.txt.get(fqdn).cloned().unwrap_or_default())
    }
}

#[tokio::test]
pub async fn test_make_directory() {
    let server = with_directory_server();
    let res = reqwest::get(&server.dir_url).await.unwrap();
    assert!(res.status().is_success());

    let res = reqwest::get(format!("{}/missing.pem", server.url)).await.unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn fake_provider_manages_a_records() {
    let dns = FakeDns::default();
    let provider = dns.provider("fake");
    let ip = "192.0.2.10".parse().unwrap();

    provider.set_record_a("host.example.com", 300, ip).await.unwrap();
    assert_eq!(dns.state.lock().a["host.example.com"], (300, ip));

    provider.delete_record_a("host.example.com").await.unwrap();
    assert!(dns.state.lock().a.is_empty());
}
