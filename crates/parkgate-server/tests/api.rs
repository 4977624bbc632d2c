use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{Duration, Utc};
use parkgate_config::{Agent, Commands, Config, Heartbeat, Receivers, Scanner, Server, Store, WeCom};
use parkgate_kernel::{signature, verify_signature, MsgCrypt};
use parkgate_server::approval::ApprovalOutcome;
use parkgate_server::dispatch::{outer_encrypt, parse_inbound};
use parkgate_server::heartbeat::HeartbeatEdge;
use parkgate_server::{router, AppState};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const AES_KEY: &str = "joQ3dt58VNQzMbpWwa4MoVPUBaHQVPRx1aIYa8Cr2pj";
const TOKEN: &str = "oGLIAWAUTkFLKFysSBq";
const CORP_ID: &str = "ww0e92b0a70b5f5bb6";
const API_KEY: &str = "site-agent-key";
const ADMIN: &str = "admin1";

fn config(api_base: &str) -> Config {
    Config {
        server: Server {
            listen_addr: "127.0.0.1:0".to_string(),
        },
        store: Store {
            kind: "memory".to_string(),
            sqlite_path: None,
        },
        wecom: WeCom {
            corp_id: CORP_ID.to_string(),
            agent_id: 1000002,
            corp_secret: "secret".to_string(),
            token: TOKEN.to_string(),
            encoding_aes_key: AES_KEY.to_string(),
            approval_template_id: "tpl".to_string(),
            api_base: api_base.to_string(),
            timeout_ms: 2000,
            access_token_expire_time: 7200,
            token_cache_path: None,
            message_retry_times: 3,
            message_retry_interval: 0,
            default_message_receiver: Receivers {
                touser: vec![ADMIN.to_string()],
                ..Receivers::default()
            },
            approval_controls: Default::default(),
            approvers: vec![],
        },
        agent: Agent {
            api_key: API_KEY.to_string(),
        },
        heartbeat: Heartbeat::default(),
        scanner: Scanner {
            enabled: false,
            ..Scanner::default()
        },
        commands: Commands::default(),
    }
}

/// Platform double that hands out a token and accepts every message.
async fn platform() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gettoken"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0, "errmsg": "ok", "access_token": "T1", "expires_in": 7200
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/message/send"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0, "errmsg": "ok", "msgid": "m1"
        })))
        .mount(&server)
        .await;
    server
}

async fn gateway() -> (MockServer, AppState, Router) {
    let server = platform().await;
    let state = AppState::new(config(&server.uri())).unwrap();
    let app = router(state.clone());
    (server, state, app)
}

async fn sent_texts(server: &MockServer) -> Vec<String> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == "/message/send")
        .filter_map(|r| serde_json::from_slice::<Value>(&r.body).ok())
        .filter_map(|v| v.pointer("/text/content").and_then(Value::as_str).map(str::to_string))
        .collect()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn agent_get(app: &Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .uri(uri)
        .header("x-api-key", API_KEY)
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn agent_post(app: &Router, uri: &str, payload: Value) -> (StatusCode, Value) {
    let request = Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-api-key", API_KEY)
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap();
    let (status, body) = send(app, request).await;
    (status, serde_json::from_slice(&body).unwrap())
}

/// Percent-encodes everything outside the unreserved set.
fn query_escape(raw: &str) -> String {
    raw.bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                char::from(b).to_string()
            }
            other => format!("%{other:02X}"),
        })
        .collect()
}

fn crypt() -> MsgCrypt {
    MsgCrypt::new(AES_KEY, CORP_ID).unwrap()
}

/// Encrypted, signed callback POST carrying `inner` as the message body.
fn callback(inner: &str) -> Request<Body> {
    let encrypt = crypt().encrypt(inner.as_bytes()).unwrap();
    let (ts, nonce) = ("1700000000", "n0nce");
    let sig = signature(TOKEN, ts, nonce, &encrypt);
    let body = format!(
        "<xml><ToUserName><![CDATA[{CORP_ID}]]></ToUserName>\
         <Encrypt><![CDATA[{encrypt}]]></Encrypt><AgentID><![CDATA[1000002]]></AgentID></xml>"
    );
    Request::builder()
        .method("POST")
        .uri(format!("/qy?msg_signature={sig}&timestamp={ts}&nonce={nonce}"))
        .body(Body::from(body))
        .unwrap()
}

fn text_message(from: &str, content: &str) -> Request<Body> {
    callback(&format!(
        "<xml><ToUserName><![CDATA[{CORP_ID}]]></ToUserName>\
         <FromUserName><![CDATA[{from}]]></FromUserName><CreateTime>1700000000</CreateTime>\
         <MsgType><![CDATA[text]]></MsgType><Content><![CDATA[{content}]]></Content>\
         <MsgId>1</MsgId><AgentID>1000002</AgentID></xml>"
    ))
}

/// Verifies and decrypts a passive reply, returning its text content.
fn open_reply(body: &[u8]) -> String {
    let raw = std::str::from_utf8(body).unwrap();
    let doc = roxmltree::Document::parse(raw).unwrap();
    let field = |name: &str| {
        doc.root_element()
            .children()
            .find(|n| n.has_tag_name(name))
            .and_then(|n| n.text())
            .unwrap()
            .to_string()
    };
    let encrypt = outer_encrypt(raw).unwrap();
    verify_signature(TOKEN, &field("MsgSignature"), &field("TimeStamp"), &field("Nonce"), &encrypt)
        .unwrap();
    let inner = String::from_utf8(crypt().decrypt(&encrypt).unwrap()).unwrap();
    let msg = parse_inbound(&inner).unwrap();
    assert_eq!(msg.agent_id, "1000002");
    msg.content
}

async fn command(app: &Router, from: &str, text: &str) -> String {
    let (status, body) = send(app, text_message(from, text)).await;
    assert_eq!(status, StatusCode::OK);
    open_reply(&body)
}

async fn seed(app: &Router) {
    let (status, body) = agent_post(
        app,
        "/car_park",
        json!({
            "persons": [
                {"id": "p1", "name": "张三", "phone": "13800000000"},
                {"id": "p2", "name": "李四", "phone": "13900000000"}
            ],
            "plates": [
                {"plate": "川AAB1234", "person_id": "p1", "class": "owner_primary",
                 "end_time": "2099-06-30 23:59:59", "pRemark": ""},
                {"plate": "川A99999", "person_id": "p2", "class": "tenant_or_external",
                 "end_time": "2099-01-31 23:59:59", "pRemark": "访客"}
            ]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["plates"], 2);
}

#[tokio::test]
async fn healthz_is_ok() {
    let (_platform, _state, app) = gateway().await;
    let (status, body) = send(&app, Request::get("/healthz").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn url_verification_echoes_decrypted_string() {
    let (_platform, _state, app) = gateway().await;
    let echo = "3c96cMG/VAZs0UBChHG8geFhF/OwmQ6Tuae6atDzSAwYmx5LxfAdeHxu5axLLAxwmD6/hy71905E4+RlYreJSQ==";
    let uri = format!(
        "/qy?msg_signature=702a033d180da8da40c6a2f704f346469d73c285&timestamp=1409659813&nonce=1372623149&echostr={}",
        query_escape(echo)
    );
    let (status, body) = send(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"1616140317555161061");

    let tampered = format!(
        "/qy?msg_signature=0000000000000000000000000000000000000000&timestamp=1409659813&nonce=1372623149&echostr={}",
        query_escape(echo)
    );
    let (status, _) = send(&app, Request::get(tampered).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn forged_callback_is_acknowledged_without_reply() {
    let (_platform, _state, app) = gateway().await;
    let request = Request::builder()
        .method("POST")
        .uri("/qy?msg_signature=deadbeef&timestamp=1&nonce=2")
        .body(Body::from("<xml><Encrypt><![CDATA[AAAA]]></Encrypt></xml>"))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"success");
}

#[tokio::test]
async fn plate_query_replies_with_owner_and_expiry() {
    let (_platform, _state, app) = gateway().await;
    seed(&app).await;

    let reply = command(&app, "zhangsan", "川aab1234").await;
    let lines: Vec<&str> = reply.lines().collect();
    assert_eq!(lines[0], "车牌号：川AAB1234");
    assert_eq!(lines[1], "车主：张三");
    assert_eq!(lines[2], "车辆类型：业主首车");
    assert_eq!(lines[3], "到期时间：2099-06-30");
    assert!(lines[4].starts_with("剩余天数：") && lines[4].ends_with('天'));
    assert!(reply.contains("联系电话：13800000000"));

    let miss = command(&app, "zhangsan", "川Z00000").await;
    assert_eq!(miss, "未找到车牌或车主：川Z00000");
}

#[tokio::test]
async fn unparseable_text_gets_usage_hint() {
    let (_platform, _state, app) = gateway().await;
    let reply = command(&app, "zhangsan", "今天 天气 不错").await;
    assert!(reply.starts_with("可用指令："), "{reply}");
    let hint = command(&app, ADMIN, "续期,张三,川AAB1234").await;
    assert_eq!(hint, "指令格式错误，正确格式：续期,车主,车牌,月数");
}

#[tokio::test]
async fn renewal_tickets_close_in_arrival_order() {
    let (platform, _state, app) = gateway().await;
    seed(&app).await;

    let first = command(&app, ADMIN, "续期：张三,川AAB1234,3").await;
    assert!(first.contains("#1"), "{first}");
    let second = command(&app, ADMIN, "续期 张三 川AAB1234 1").await;
    assert!(second.contains("#2"), "{second}");

    let (status, body) = agent_get(&app, "/review").await;
    assert_eq!(status, StatusCode::OK);
    let open = body["data"].as_array().unwrap();
    assert_eq!(open.len(), 2);
    assert_eq!(open[0]["car_number"], "川AAB1234");
    assert_eq!(open[0]["owner_name"], "张三");
    assert_eq!(open[0]["status"], "pending");
    assert_eq!(open[0]["months"], 3);

    let update = json!({"car_number": "川AAB1234", "status": "complete"});
    let (status, body) = agent_post(&app, "/review", update.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], 1);
    assert_eq!(body["data"]["status"], "complete");
    let (_, body) = agent_post(&app, "/review", update.clone()).await;
    assert_eq!(body["data"]["id"], 2);
    let (status, _) = agent_post(&app, "/review", update).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = agent_get(&app, "/review").await;
    assert_eq!(body["data"].as_array().unwrap().len(), 0);

    // Admin notifications are spawned; give them a moment to land.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let texts = sent_texts(&platform).await;
    assert!(texts.iter().any(|t| t.contains("续期工单 #1 已完成")));
}

#[tokio::test]
async fn non_admin_cannot_renew() {
    let (_platform, _state, app) = gateway().await;
    seed(&app).await;
    let reply = command(&app, "zhangsan", "续期,张三,川AAB1234,3").await;
    assert_eq!(reply, "您没有权限执行该指令");
    let (_, body) = agent_get(&app, "/review").await;
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn review_update_rejects_open_status() {
    let (_platform, _state, app) = gateway().await;
    seed(&app).await;
    let (status, body) = agent_post(
        &app,
        "/review",
        json!({"car_number": "川AAB1234", "status": "pending"}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);
}

async fn mount_approval(platform: &MockServer, sp_no: &str) {
    Mock::given(method("POST"))
        .and(path("/oa/getapprovaldetail"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0,
            "errmsg": "ok",
            "info": {
                "sp_no": sp_no,
                "sp_status": 2,
                "apply_time": 1_717_200_000,
                "applyer": {"userid": ADMIN},
                "apply_data": {"contents": [
                    {"control": "Text", "id": "Text-1",
                     "title": [{"text": "车牌号", "lang": "zh_CN"}],
                     "value": {"text": "川aab1234"}},
                    {"control": "Text", "id": "Text-2",
                     "title": [{"text": "车主姓名", "lang": "zh_CN"}],
                     "value": {"text": "张三"}},
                    {"control": "Number", "id": "Number-1",
                     "title": [{"text": "续期月数", "lang": "zh_CN"}],
                     "value": {"new_number": "3"}},
                    {"control": "Money", "id": "Money-1",
                     "title": [{"text": "缴费金额", "lang": "zh_CN"}],
                     "value": {"new_money": "900"}}
                ]}
            }
        })))
        .mount(platform)
        .await;
}

#[tokio::test]
async fn approval_is_applied_once() {
    let (platform, state, app) = gateway().await;
    seed(&app).await;
    mount_approval(&platform, "202506010001").await;

    let applied = match state.process_approval("202506010001", 2).await {
        ApprovalOutcome::Applied(applied) => applied,
        other => panic!("expected the approval to apply, got {other:?}"),
    };
    assert_eq!(applied.plate.plate, "川AAB1234");

    let replay = state.process_approval("202506010001", 2).await;
    assert!(matches!(replay, ApprovalOutcome::Duplicate), "{replay:?}");

    let (_, body) = agent_get(&app, &format!("/car_park?car_number={}", query_escape("川aab1234"))).await;
    assert_eq!(body["data"]["plate"]["end_time"], "2099-09-30 23:59:59");
    assert_eq!(body["data"]["plate"]["synced"], false);

    let (_, body) = agent_get(&app, "/review").await;
    let open = body["data"].as_array().unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0]["months"], 3);
    assert_eq!(open[0]["approval_sp_no"], "202506010001");

    let texts = sent_texts(&platform).await;
    assert!(texts.iter().any(|t| t.contains("续期审批已处理")));
    assert!(texts.iter().any(|t| t.contains("审批单号 202506010001 已经处理过")));
}

#[tokio::test]
async fn pending_approval_is_ignored() {
    let (_platform, state, app) = gateway().await;
    seed(&app).await;
    assert!(matches!(
        state.process_approval("202506010002", 1).await,
        ApprovalOutcome::Ignored
    ));
}

#[tokio::test]
async fn approval_event_is_acknowledged_immediately() {
    let (platform, _state, app) = gateway().await;
    seed(&app).await;
    mount_approval(&platform, "202506010003").await;
    let event = callback(
        "<xml><ToUserName><![CDATA[ww]]></ToUserName><FromUserName><![CDATA[sys]]></FromUserName>\
         <CreateTime>1700000000</CreateTime><MsgType><![CDATA[event]]></MsgType>\
         <Event><![CDATA[sys_approval_change]]></Event><AgentID>1000002</AgentID>\
         <ApprovalInfo><SpNo>202506010003</SpNo><SpStatus>2</SpStatus>\
         <SpRecord><SpStatus>1</SpStatus></SpRecord></ApprovalInfo></xml>",
    );
    let (status, body) = send(&app, event).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"success");
}

#[tokio::test]
async fn plate_rename_flows_through_the_agent() {
    let (_platform, _state, app) = gateway().await;
    seed(&app).await;

    let reply = command(&app, ADMIN, "修改车牌,川AAB1234,川AAC5678").await;
    assert!(reply.contains("川AAB1234 → 川AAC5678"), "{reply}");
    let taken = command(&app, ADMIN, "修改车牌,川AAB1234,川A99999").await;
    assert_eq!(taken, "新车牌 川A99999 已存在");

    let (_, body) = agent_get(&app, "/review").await;
    let open = body["data"].as_array().unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0]["status"], "change");
    assert_eq!(open[0]["remark"], "川AAC5678");

    let (status, body) = agent_post(
        &app,
        "/review",
        json!({"car_number": "川AAB1234", "status": "changed"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "changed");

    assert_eq!(
        command(&app, ADMIN, "川AAB1234").await,
        "未找到车牌或车主：川AAB1234"
    );
    let renamed = command(&app, ADMIN, "川AAC5678").await;
    assert!(renamed.starts_with("车牌号：川AAC5678\n车主：张三"), "{renamed}");
}

#[tokio::test]
async fn agent_endpoints_require_the_key() {
    let (_platform, _state, app) = gateway().await;
    let (status, body) = send(&app, Request::get("/review").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["code"], 401);

    let wrong = Request::builder()
        .uri("/car_park")
        .header("x-api-key", "nope")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, wrong).await.0, StatusCode::UNAUTHORIZED);

    let via_query = Request::get(format!("/client_alive?api_key={API_KEY}&status=running"))
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, via_query).await.0, StatusCode::OK);
}

#[tokio::test]
async fn push_keeps_gateway_remark_and_lookup_misses_are_404() {
    let (_platform, _state, app) = gateway().await;
    seed(&app).await;
    let reply = command(&app, ADMIN, "备注,川AAB1234,月底搬走").await;
    assert!(reply.contains("月底搬走"), "{reply}");

    let (status, _) = agent_post(
        &app,
        "/car_park",
        json!({"plates": [{"plate": "川AAB1234", "person_id": "p1", "class": "owner_primary",
                           "end_time": "2099-06-30 23:59:59", "pRemark": "旧备注"}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = agent_get(&app, &format!("/car_park?owner_name={}", query_escape("张三"))).await;
    assert_eq!(body["data"]["plate"]["pRemark"], "月底搬走");
    assert_eq!(body["data"]["person"]["phone"], "13800000000");

    let (status, _) = agent_get(&app, &format!("/car_park?car_number={}", query_escape("川Z00000"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, dump) = agent_get(&app, "/car_park").await;
    assert_eq!(dump["data"]["persons"].as_array().unwrap().len(), 2);
    assert_eq!(dump["data"]["plates"].as_array().unwrap().len(), 2);

    let (status, _) = agent_post(&app, "/car_park", json!({"plates": "oops"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn silent_agent_alerts_once_then_recovers() {
    let (platform, state, app) = gateway().await;
    let (status, _) = agent_get(&app, "/client_alive?status=running").await;
    assert_eq!(status, StatusCode::OK);

    let later = Utc::now() + Duration::minutes(65);
    assert!(matches!(
        state.check_heartbeat(later).await,
        Some(HeartbeatEdge::Offline { .. })
    ));
    assert_eq!(state.check_heartbeat(later + Duration::minutes(5)).await, None);

    agent_get(&app, "/client_alive?status=running").await;
    assert!(matches!(
        state.check_heartbeat(Utc::now()).await,
        Some(HeartbeatEdge::Recovered { .. })
    ));

    let texts = sent_texts(&platform).await;
    assert_eq!(texts.iter().filter(|t| t.contains("已离线")).count(), 1);
    assert_eq!(texts.iter().filter(|t| t.contains("已恢复在线")).count(), 1);
}

#[tokio::test]
async fn non_utf8_callback_body_is_acknowledged() {
    let (_platform, _state, app) = gateway().await;
    let request = Request::builder()
        .method("POST")
        .uri("/qy?msg_signature=deadbeef&timestamp=1&nonce=2")
        .body(Body::from(vec![0xff, 0xfe, b'<', b'x']))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"success");
}

#[tokio::test]
async fn push_with_unreadable_end_time_is_rejected_untouched() {
    let (_platform, _state, app) = gateway().await;
    seed(&app).await;
    let (status, body) = agent_post(
        &app,
        "/car_park",
        json!({"plates": [{"plate": "川AAB1234", "person_id": "p1", "class": "owner_primary",
                           "end_time": "10/06/2026", "pRemark": ""}]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);

    let (_, body) = agent_get(&app, &format!("/car_park?car_number={}", query_escape("川AAB1234"))).await;
    assert_eq!(body["data"]["plate"]["end_time"], "2099-06-30 23:59:59");
}

#[tokio::test]
async fn expiry_scan_notifies_owner_and_admins() {
    let (platform, state, app) = gateway().await;
    seed(&app).await;
    let now = chrono::Local::now().naive_local();
    let soon = (now + Duration::days(2)).format("%Y-%m-%d %H:%M:%S").to_string();
    let (status, _) = agent_post(
        &app,
        "/car_park",
        json!({"plates": [{"plate": "川AAB1111", "person_id": "p1", "class": "owner_secondary",
                           "end_time": soon, "pRemark": ""}]}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(command(&app, "zhangsan", "绑定,张三,13800000000").await, "绑定成功：张三");

    let report = state.run_expiry_scan(now).await.unwrap();
    assert_eq!(report.soon, 1);
    assert_eq!(report.expired, 0);
    assert_eq!(report.users_notified, 1);
    assert_eq!(report.admin_messages, 2);
    assert_eq!(report.failures, 0);

    let sends: Vec<Value> = platform
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| r.url.path() == "/message/send")
        .filter_map(|r| serde_json::from_slice(&r.body).ok())
        .collect();
    let owner = sends
        .iter()
        .find(|v| v["touser"] == "zhangsan")
        .expect("owner notice");
    let notice = owner["text"]["content"].as_str().unwrap();
    assert!(notice.starts_with("【停车到期提醒】"), "{notice}");
    assert!(notice.contains("川AAB1111"));

    let texts = sent_texts(&platform).await;
    assert!(texts.contains(&"【到期汇总】即将到期1辆，近期已过期0辆".to_string()));
    assert!(texts.iter().any(|t| t.starts_with("到期明细（1/1）") && t.contains("川AAB1111")));
}

#[tokio::test]
async fn approval_command_introspects_the_template() {
    let (platform, _state, app) = gateway().await;
    seed(&app).await;
    Mock::given(method("POST"))
        .and(path("/oa/gettemplatedetail"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0,
            "errmsg": "ok",
            "template_content": {"controls": [
                {"property": {"control": "Text", "id": "Text-P",
                              "title": [{"text": "车牌号", "lang": "zh_CN"}]}},
                {"property": {"control": "Text", "id": "Text-O",
                              "title": [{"text": "车主姓名", "lang": "zh_CN"}]}},
                {"property": {"control": "Number", "id": "Number-M",
                              "title": [{"text": "续期月数", "lang": "zh_CN"}]}}
            ]}
        })))
        .expect(1)
        .mount(&platform)
        .await;
    Mock::given(method("POST"))
        .and(path("/oa/applyevent"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "errcode": 0, "errmsg": "ok", "sp_no": "202506020001"
        })))
        .expect(1)
        .mount(&platform)
        .await;

    let reply = command(&app, ADMIN, "审批,川AAB1234,3").await;
    assert_eq!(
        reply,
        "已发起续期审批\n车牌：川AAB1234\n续期：3个月\n审批单号：202506020001"
    );

    let applied: Value = platform
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .find(|r| r.url.path() == "/oa/applyevent")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .expect("applyevent request");
    assert_eq!(applied["creator_userid"], ADMIN);
    assert_eq!(applied["template_id"], "tpl");
    let contents = applied["apply_data"]["contents"].as_array().unwrap();
    let value_of = |id: &str| {
        contents
            .iter()
            .find(|c| c["id"] == id)
            .map(|c| c["value"].clone())
            .unwrap_or(Value::Null)
    };
    assert_eq!(value_of("Text-P"), json!({"text": "川AAB1234"}));
    assert_eq!(value_of("Number-M"), json!({"new_number": "3"}));
    assert_eq!(value_of("Text-O"), json!({"text": "张三"}));

    let refused = command(&app, "zhangsan", "审批,川AAB1234,3").await;
    assert_eq!(refused, "您没有权限执行该指令");
}

#[tokio::test]
async fn records_reply_is_cached_until_rebinding() {
    let (platform, state, app) = gateway().await;
    seed(&app).await;
    assert!(command(&app, "zhangsan", "记录查询").await.starts_with("您尚未绑定车主信息"));

    assert_eq!(command(&app, "zhangsan", "绑定,张三,13800000000").await, "绑定成功：张三");
    assert_eq!(command(&app, "zhangsan", "记录查询").await, "最近30天没有续费记录");

    mount_approval(&platform, "202506040001").await;
    assert!(matches!(
        state.process_approval("202506040001", 2).await,
        ApprovalOutcome::Applied(_)
    ));
    assert_eq!(command(&app, "zhangsan", "记录查询").await, "最近30天没有续费记录");

    assert_eq!(command(&app, "zhangsan", "解绑,张三,13800000000").await, "已解绑 张三");
    assert_eq!(command(&app, "zhangsan", "绑定,张三,13800000000").await, "绑定成功：张三");
    let fresh = command(&app, "zhangsan", "记录查询").await;
    assert!(fresh.starts_with("最近30天续费记录：\n1. "), "{fresh}");
    assert!(fresh.contains("川AAB1234 金额9"), "{fresh}");
}

#[tokio::test]
async fn binding_through_commands() {
    let (_platform, _state, app) = gateway().await;
    seed(&app).await;

    assert_eq!(command(&app, "zhangsan", "绑定,张三,13800000000").await, "绑定成功：张三");
    assert_eq!(
        command(&app, "zhangsan", "绑定,张三,13800000000").await,
        "您已绑定 张三，无需重复绑定"
    );
    assert_eq!(
        command(&app, "lisi", "绑定,张三,13800000000").await,
        "张三 已绑定其他企业微信账号"
    );
    assert_eq!(
        command(&app, "zhangsan", "绑定,李四,13900000000").await,
        "当前账号已绑定 张三，请先解绑"
    );
    assert_eq!(
        command(&app, "zhangsan", "绑定,王五,13700000000").await,
        "未找到人员 王五"
    );

    assert_eq!(
        command(&app, "lisi", "解绑,张三,13800000000").await,
        "张三 绑定的不是当前账号"
    );
    assert_eq!(command(&app, "zhangsan", "解绑,张三,13800000000").await, "已解绑 张三");
    assert_eq!(
        command(&app, "zhangsan", "解绑,张三,13800000000").await,
        "张三 尚未绑定"
    );

    assert_eq!(command(&app, "lisi", "绑定,张三,13800000000").await, "绑定成功：张三");
    assert_eq!(command(&app, ADMIN, "解绑,张三,13800000000").await, "已解绑 张三");
}

#[tokio::test]
async fn rename_is_limited_to_the_owner_or_an_admin() {
    let (_platform, _state, app) = gateway().await;
    seed(&app).await;

    let refused = command(&app, "lisi", "修改车牌,川AAB1234,川AAC5678").await;
    assert_eq!(refused, "只能修改本人名下的车牌");
    let (_, body) = agent_get(&app, "/review").await;
    assert!(body["data"].as_array().unwrap().is_empty());

    assert_eq!(command(&app, "zhangsan", "绑定,张三,13800000000").await, "绑定成功：张三");
    let own = command(&app, "zhangsan", "修改车牌,川AAB1234,川AAC5678").await;
    assert!(own.contains("川AAB1234 → 川AAC5678"), "{own}");
}

#[tokio::test]
async fn approval_for_unknown_plate_alerts_admins() {
    let (platform, state, _app) = gateway().await;
    mount_approval(&platform, "202506030001").await;

    let reason = match state.process_approval("202506030001", 2).await {
        ApprovalOutcome::Failed(reason) => reason,
        other => panic!("expected a failure, got {other:?}"),
    };
    assert!(reason.starts_with("未找到车牌"), "{reason}");

    let texts = sent_texts(&platform).await;
    let notice = texts
        .iter()
        .find(|t| t.starts_with("续期审批处理失败"))
        .expect("admin failure notice");
    assert!(notice.contains("审批单号：202506030001"));
    assert!(notice.contains("车主：张三"));
    assert!(notice.contains(&format!("原因：{reason}")));

    // Nothing was applied, so a later retry is not treated as a duplicate.
    assert!(matches!(
        state.process_approval("202506030001", 2).await,
        ApprovalOutcome::Failed(_)
    ));
}

#[tokio::test]
async fn abnormal_client_status_alerts_admins() {
    let (platform, _state, app) = gateway().await;
    let (status, _) = agent_get(&app, "/client_alive?status=stopped&process_id=4242").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = agent_get(&app, "/client_alive?status=running").await;
    assert_eq!(status, StatusCode::OK);

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let alerts: Vec<String> = sent_texts(&platform)
        .await
        .into_iter()
        .filter(|t| t.starts_with("【告警】现场同步程序状态异常"))
        .collect();
    assert_eq!(alerts.len(), 1, "{alerts:?}");
    assert!(alerts[0].contains("状态：stopped"));
    assert!(alerts[0].contains("进程：4242"));
}
