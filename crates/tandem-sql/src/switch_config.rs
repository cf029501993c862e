//! Writes to the switch's realtime configuration tables. The switch reads
//! these rows directly; the router never parses them back.

pub struct EndpointRow<'a> {
    pub id: &'a str,
    pub transport: &'a str,
    pub aors: &'a str,
    pub auth: Option<&'a str>,
    pub context: &'a str,
    pub allow: &'a str,
    pub identify_by: &'a str,
    pub outbound_auth: Option<&'a str>,
    pub from_user: Option<&'a str>,
}

pub async fn upsert_endpoint(
    executor: impl sqlx::PgExecutor<'_>,
    row: EndpointRow<'_>,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ps_endpoints (
            id, transport, aors, auth, context, disallow, allow,
            direct_media, rewrite_contact, rtp_symmetric, force_rport,
            identify_by, outbound_auth, from_user
        ) VALUES ($1, $2, $3, $4, $5, 'all', $6, 'no', 'yes', 'yes', 'yes', $7, $8, $9)
        ON CONFLICT (id) DO UPDATE SET
            transport = EXCLUDED.transport,
            aors = EXCLUDED.aors,
            auth = EXCLUDED.auth,
            context = EXCLUDED.context,
            allow = EXCLUDED.allow,
            identify_by = EXCLUDED.identify_by,
            outbound_auth = EXCLUDED.outbound_auth,
            from_user = EXCLUDED.from_user
        "#,
    )
    .bind(row.id)
    .bind(row.transport)
    .bind(row.aors)
    .bind(row.auth)
    .bind(row.context)
    .bind(row.allow)
    .bind(row.identify_by)
    .bind(row.outbound_auth)
    .bind(row.from_user)
    .execute(executor)
    .await
    .map(|_| ())
}

pub async fn upsert_aor(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
    contact: &str,
    qualify_frequency: i64,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ps_aors (id, contact, max_contacts, qualify_frequency, remove_existing)
        VALUES ($1, $2, 1, $3, 'yes')
        ON CONFLICT (id) DO UPDATE SET
            contact = EXCLUDED.contact,
            qualify_frequency = EXCLUDED.qualify_frequency
        "#,
    )
    .bind(id)
    .bind(contact)
    .bind(qualify_frequency)
    .execute(executor)
    .await
    .map(|_| ())
}

pub async fn upsert_auth(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
    username: &str,
    password: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ps_auths (id, auth_type, username, password)
        VALUES ($1, 'userpass', $2, $3)
        ON CONFLICT (id) DO UPDATE SET
            username = EXCLUDED.username,
            password = EXCLUDED.password
        "#,
    )
    .bind(id)
    .bind(username)
    .bind(password)
    .execute(executor)
    .await
    .map(|_| ())
}

/// Maps a source address onto an endpoint for IP-based identification.
pub async fn upsert_identify(
    executor: impl sqlx::PgExecutor<'_>,
    id: &str,
    endpoint: &str,
    host: &str,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ps_endpoint_id_ips (id, endpoint, match)
        VALUES ($1, $2, $3)
        ON CONFLICT (id) DO UPDATE SET
            endpoint = EXCLUDED.endpoint,
            match = EXCLUDED.match
        "#,
    )
    .bind(id)
    .bind(endpoint)
    .bind(host)
    .execute(executor)
    .await
    .map(|_| ())
}

/// Removes every realtime row belonging to one endpoint: the endpoint and
/// AOR rows keyed by `endpoint_id`, the auth row keyed by `auth_id`, and
/// any IP-identify rows pointing at the endpoint.
pub async fn delete_endpoint_rows(
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    endpoint_id: &str,
    auth_id: &str,
) -> sqlx::Result<()> {
    sqlx::query("DELETE FROM ps_endpoint_id_ips WHERE id = $1 OR endpoint = $1")
        .bind(endpoint_id)
        .execute(&mut *txn)
        .await?;
    sqlx::query("DELETE FROM ps_endpoints WHERE id = $1")
        .bind(endpoint_id)
        .execute(&mut *txn)
        .await?;
    sqlx::query("DELETE FROM ps_auths WHERE id = $1")
        .bind(auth_id)
        .execute(&mut *txn)
        .await?;
    sqlx::query("DELETE FROM ps_aors WHERE id = $1")
        .bind(endpoint_id)
        .execute(&mut *txn)
        .await?;
    Ok(())
}

/// Seeds the transport, identifier ordering, and the dialplan contexts
/// that hand inbound and returning calls to the router's control service.
pub async fn bootstrap_switch(
    txn: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    agi_host: &str,
    agi_port: u16,
) -> sqlx::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO ps_transports (id, bind, protocol, tos, cos)
        VALUES ('transport-udp', '0.0.0.0:5060', 'udp', 'cs3', 3)
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .execute(&mut *txn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO ps_globals (id, endpoint_identifier_order)
        VALUES ('global', 'ip,username,anonymous')
        ON CONFLICT (id) DO NOTHING
        "#,
    )
    .execute(&mut *txn)
    .await?;

    let agi = |request: &str| {
        format!("agi://{agi_host}:{agi_port}/{request}")
    };

    // (context, exten, priority, app, appdata)
    let rows: Vec<(&str, &str, i64, &str, String)> = vec![
        ("from-origination", "_X.", 1, "AGI", agi("processIncoming")),
        (
            "from-origination",
            "_X.",
            2,
            "Dial",
            "PJSIP/${DNIS_TO_SEND}@${NEXT_HOP}".to_string(),
        ),
        ("from-origination", "_X.", 3, "Hangup", String::new()),
        ("from-transit", "_X.", 1, "AGI", agi("processReturn")),
        (
            "from-transit",
            "_X.",
            2,
            "Dial",
            "PJSIP/${DNIS_TO_SEND}@${NEXT_HOP}".to_string(),
        ),
        ("from-transit", "_X.", 3, "AGI", agi("processFinal")),
        ("from-transit", "_X.", 4, "Hangup", String::new()),
        ("router-hangup", "h", 1, "AGI", agi("hangup")),
    ];

    for (context, exten, priority, app, appdata) in rows {
        sqlx::query(
            r#"
            INSERT INTO extensions (context, exten, priority, app, appdata)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (context, exten, priority) DO UPDATE SET
                app = EXCLUDED.app,
                appdata = EXCLUDED.appdata
            "#,
        )
        .bind(context)
        .bind(exten)
        .bind(priority)
        .bind(app)
        .bind(appdata)
        .execute(&mut *txn)
        .await?;
    }

    Ok(())
}
